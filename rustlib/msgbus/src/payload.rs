use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Failed to read payload file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse payload file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Value generator the publisher draws each message from
pub trait PayloadSource: Send {
    fn next_value(&mut self) -> Result<Vec<u8>, PayloadError>;
}

impl<F> PayloadSource for F
where
    F: FnMut() -> Result<Vec<u8>, PayloadError> + Send,
{
    fn next_value(&mut self) -> Result<Vec<u8>, PayloadError> {
        self()
    }
}

/// Same serialized bytes on every call
#[derive(Debug, Clone)]
pub struct StaticPayload {
    bytes: Vec<u8>,
}

impl StaticPayload {
    /// Serializes `value` up front so a bad payload fails here, not mid-run
    pub fn new(value: &Value) -> Result<Self, PayloadError> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl PayloadSource for StaticPayload {
    fn next_value(&mut self) -> Result<Vec<u8>, PayloadError> {
        Ok(self.bytes.clone())
    }
}

/// Wraps the payload with a sequence number and send time:
/// `{"seq": n, "sent_at": "<RFC 3339>", "data": <payload>}`
#[derive(Debug, Clone)]
pub struct SequencedPayload {
    data: Value,
    seq: u64,
}

impl SequencedPayload {
    pub fn new(data: Value) -> Result<Self, PayloadError> {
        serde_json::to_vec(&data)?;
        Ok(Self { data, seq: 0 })
    }
}

impl PayloadSource for SequencedPayload {
    fn next_value(&mut self) -> Result<Vec<u8>, PayloadError> {
        self.seq += 1;
        let envelope = json!({
            "seq": self.seq,
            "sent_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "data": self.data,
        });
        Ok(serde_json::to_vec(&envelope)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    #[default]
    Static,
    Sequenced,
}

impl FromStr for PayloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(PayloadMode::Static),
            "sequenced" => Ok(PayloadMode::Sequenced),
            other => Err(format!(
                "unknown payload mode {:?}, expected static or sequenced",
                other
            )),
        }
    }
}

impl fmt::Display for PayloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadMode::Static => write!(f, "static"),
            PayloadMode::Sequenced => write!(f, "sequenced"),
        }
    }
}

/// Reads and parses a JSON document
pub fn load_json(path: &Path) -> Result<Value, PayloadError> {
    let raw = std::fs::read(path).map_err(|source| PayloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| PayloadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the payload file once and builds the source for `mode`
pub fn source_from_file(
    path: &Path,
    mode: PayloadMode,
) -> Result<Box<dyn PayloadSource>, PayloadError> {
    let value = load_json(path)?;
    let source: Box<dyn PayloadSource> = match mode {
        PayloadMode::Static => Box::new(StaticPayload::new(&value)?),
        PayloadMode::Sequenced => Box::new(SequencedPayload::new(value)?),
    };
    log::info!("Loaded payload from {} mode={}", path.display(), mode);
    Ok(source)
}
