//! Error types for txorm operations.

use std::fmt;

/// The primary error type for all txorm operations.
#[derive(Debug)]
pub enum Error {
    /// Entity/attribute definition errors, raised once while building a schema
    Schema(SchemaError),
    /// In-memory cache consistency errors (index collisions, stale reads, constraints)
    Cache(CacheError),
    /// Unresolvable save order between newly created objects
    Dependency(DependencyError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Value does not match the declared attribute type
    Type(TypeError),
    /// Missing required value or null in a non-nullable attribute
    Validation(ValidationError),
    /// Storage errors surfaced by the driver
    Query(QueryError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub entity: Option<String>,
    pub attribute: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Referenced entity was never declared
    UnknownEntity,
    /// Referenced attribute does not exist
    UnknownAttribute,
    /// No reverse attribute could be found for a relationship
    ReverseNotFound,
    /// More than one candidate reverse attribute
    AmbiguousReverse,
    /// Explicit reverse does not point back, or is already paired
    ReverseMismatch,
    /// Primary key declared twice or redeclared in a subtype
    DuplicatePrimaryKey,
    /// Invalid relationship cardinality
    InvalidRelationship,
    /// Invalid primary or unique key definition
    InvalidKey,
    /// Entity or attribute name is not a valid identifier
    InvalidName,
    /// Inheritance hierarchy errors
    Inheritance,
    /// Column/table mapping errors
    Mapping,
    /// Too many attributes to track with the dirty bitmask
    TooManyAttributes,
}

#[derive(Debug)]
pub struct CacheError {
    pub kind: CacheErrorKind,
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// Two objects claim the same key in an identity-map index
    UniqueViolation,
    /// A previously read value changed in storage
    UnrepeatableRead,
    /// An UPDATE/DELETE/verification matched no row
    StaleRead,
    /// A relationship constraint forbids the operation
    Constraint,
    /// Operation on a deleted or cancelled object
    ObjectDeleted,
    /// Attempt to change an assigned primary key
    PrimaryKeyChange,
    /// Lazy load found no row for a known key
    ObjectNotFound,
    /// Unique lookup returned several rows
    MultipleObjectsFound,
    /// Internal bookkeeping invariant violated
    Inconsistent,
}

#[derive(Debug)]
pub struct DependencyError {
    /// Objects on the save chain, the repeated object last
    pub chain: Vec<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Transaction was already committed or rolled back
    Closed,
    /// Object id does not belong to this transaction
    ForeignObject,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub attribute: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub attribute: String,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            attribute: None,
            message: message.into(),
        }
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

impl CacheError {
    pub fn new(kind: CacheErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            message: message.into(),
        }
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

impl Error {
    /// Shorthand for a cache error of the given kind.
    pub fn cache(kind: CacheErrorKind, message: impl Into<String>) -> Self {
        Error::Cache(CacheError::new(kind, message))
    }

    /// Shorthand for a schema error of the given kind.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError::new(kind, message))
    }

    /// Kind of the cache error, if this is one.
    pub fn cache_kind(&self) -> Option<CacheErrorKind> {
        match self {
            Error::Cache(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of the schema error, if this is one.
    pub fn schema_kind(&self) -> Option<SchemaErrorKind> {
        match self {
            Error::Schema(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Row changed or disappeared outside of the current transaction.
    pub fn is_stale(&self) -> bool {
        matches!(
            self.cache_kind(),
            Some(CacheErrorKind::StaleRead | CacheErrorKind::UnrepeatableRead)
        )
    }

    /// Uniqueness violation, either detected in the identity map or reported by storage.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Cache(e) => e.kind == CacheErrorKind::UniqueViolation,
            Error::Query(e) => e.is_unique_violation(),
            _ => false,
        }
    }

    /// Check if this error is retryable in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(e) => matches!(
                e.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Cache(_) => self.is_stale(),
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    /// Get the SQLSTATE code, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(e) => e.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Schema(e) => write!(f, "Schema error: {}", e),
            Error::Cache(e) => write!(f, "{}", e),
            Error::Dependency(e) => write!(f, "{}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Type(e) => write!(f, "{}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Query(e) => write!(f, "{}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.attribute) {
            (Some(entity), Some(attr)) => write!(f, "{}.{}: {}", entity, attr, self.message),
            (Some(entity), None) => write!(f, "{}: {}", entity, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            CacheErrorKind::UniqueViolation => "Cache index error",
            CacheErrorKind::UnrepeatableRead => "Unrepeatable read",
            CacheErrorKind::StaleRead => "Optimistic check failed",
            CacheErrorKind::Constraint => "Constraint error",
            CacheErrorKind::ObjectDeleted => "Operation with deleted object",
            CacheErrorKind::PrimaryKeyChange => "Primary key change",
            CacheErrorKind::ObjectNotFound => "Object not found",
            CacheErrorKind::MultipleObjectsFound => "Multiple objects found",
            CacheErrorKind::Inconsistent => "Internal cache inconsistency",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cannot save cyclic chain: {}", self.chain.join(" -> "))
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(attr) = &self.attribute {
            write!(
                f,
                "Type error in attribute '{}': expected {}, found {}",
                attr, self.expected, self.actual
            )
        } else {
            write!(f, "Type error: expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attribute, self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "Query error (SQLSTATE {}): {}", sqlstate, self.message)
        } else {
            write!(f, "Query error: {}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::Dependency(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for txorm operations.
pub type Result<T> = std::result::Result<T, Error>;
