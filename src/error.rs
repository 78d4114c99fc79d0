//! # Errors — Failure Taxonomy Shared by All Jobs
//!
//! Every failure the workers can hit falls into one of four kinds, and the
//! kind decides what happens next:
//!
//! | Kind | Example | Handling |
//! |------|---------|----------|
//! | Validation | oversized AOI, zoom out of range | rejected before any write |
//! | TransientStore | live-store transaction aborted, timeouts | retried (backoff or next pass) |
//! | Consistency | FK violation on an unknown task id | project rolled back, batch continues |
//! | Configuration | missing `DATABASE_URL` | fatal at startup |
//!
//! [`Error::kind`] performs the classification, including the mapping of raw
//! `sqlx` errors onto these kinds.

use std::fmt;

/// Rejections raised while validating a draft or partitioning its geometry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("geometry is empty")]
    EmptyGeometry,

    #[error("unsupported geometry type {0}")]
    UnsupportedGeometry(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("AOI area {area_km2:.2} km² exceeds the {max_km2:.2} km² limit for zoom {zoom}")]
    AreaTooLarge { area_km2: f64, max_km2: f64, zoom: u8 },

    #[error("zoom level {0} is out of range (1..=22)")]
    ZoomOutOfRange(i64),

    #[error("group size must be positive, got {0}")]
    InvalidGroupSize(i64),

    #[error("verification number must be positive, got {0}")]
    InvalidVerificationNumber(i64),

    #[error("draft is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("malformed project draft: {0}")]
    InvalidDraft(String),

    #[error("unknown project type {0}")]
    UnknownProjectType(i64),

    #[error("tile server `{0}` requires an API key but none is configured")]
    MissingTileServerKey(String),

    #[error("project {0} already exists in the live store")]
    ProjectExists(String),

    #[error("partition produced no groups")]
    NoGroups,
}

/// Failures talking to the realtime document store.
#[derive(Debug, thiserror::Error)]
pub enum LiveStoreError {
    #[error("live store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("live store returned HTTP {status} for {path}: {body}")]
    Status { status: u16, path: String, body: String },

    #[error("transaction on {path} aborted after {attempts} attempts")]
    TransactionAborted { path: String, attempts: u32 },

    #[error("could not decode value at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("live store unavailable at {0}")]
    Unavailable(String),
}

impl LiveStoreError {
    /// Network failures, 5xx answers and aborted transactions clear up on
    /// their own; 4xx answers and undecodable payloads do not.
    pub fn is_transient(&self) -> bool {
        match self {
            LiveStoreError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LiveStoreError::Status { status, .. } => *status >= 500 || *status == 429,
            LiveStoreError::TransactionAborted { .. } | LiveStoreError::Unavailable(_) => true,
            LiveStoreError::Decode { .. } => false,
        }
    }
}

/// Which store a multi-store operation failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Relational,
    LiveStore,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSide::Relational => write!(f, "relational"),
            StoreSide::LiveStore => write!(f, "live-store"),
        }
    }
}

/// Coarse classification used for retry and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    TransientStore,
    Consistency,
    Configuration,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    LiveStore(#[from] LiveStoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("consistency error for project {project_id}: {message}")]
    Consistency { project_id: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not encode {0}")]
    Encode(String),

    #[error("{side} store failed while creating project {project_id}: {source}")]
    Create {
        side: StoreSide,
        project_id: String,
        /// False when the compensating cleanup itself failed and manual
        /// repair may be needed.
        compensated: bool,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::LiveStore(e) if e.is_transient() => ErrorKind::TransientStore,
            Error::LiveStore(_) => ErrorKind::Other,
            Error::Database(e) => classify_sqlx(e),
            Error::Consistency { .. } => ErrorKind::Consistency,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Encode(_) => ErrorKind::Other,
            Error::Create { source, .. } => source.kind(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }

    /// Attach a project id to integrity violations so they surface as
    /// consistency errors instead of generic database errors.
    pub fn from_db(project_id: &str, err: sqlx::Error) -> Self {
        if classify_sqlx(&err) == ErrorKind::Consistency {
            let message = err
                .as_database_error()
                .map(|d| d.message().to_string())
                .unwrap_or_else(|| err.to_string());
            Error::Consistency {
                project_id: project_id.to_string(),
                message,
            }
        } else {
            Error::Database(err)
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => ErrorKind::TransientStore,
        sqlx::Error::Database(db) => {
            if db.is_foreign_key_violation() || db.is_unique_violation() || db.is_check_violation()
            {
                ErrorKind::Consistency
            } else if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
                // serialization failure / deadlock
                ErrorKind::TransientStore
            } else {
                ErrorKind::Other
            }
        }
        _ => ErrorKind::Other,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One item a batch job could not process, as kept in job reports.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobFailure {
    pub id: String,
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(id: &str, err: &Error) -> Self {
        JobFailure {
            id: id.to_string(),
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}
