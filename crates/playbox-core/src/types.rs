//! Wire types shared between the sandbox backend and its callers.

use serde::{Deserialize, Serialize};

/// Response from the sandbox backend to the playground frontend.
///
/// The stdout/stderr fields are base64 encoded on the wire, which isn't
/// ideal but is good enough for now.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    /// If set, we failed to run the binary. The message is user-visible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(with = "base64_bytes", default)]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub stderr: Vec<u8>,
}

impl RunResponse {
    /// A failure response. Only one of `error` and the exit/stream fields
    /// is ever populated.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }
}

/// Metadata line prepended to the binary stream on the jailed child's
/// stdin. The line is terminated by the first `\n`; everything after it is
/// the binary to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessMeta {
    /// Extra arguments appended to the program's argv.
    #[serde(default)]
    pub args: Vec<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
