//! Audio format negotiation for the session handshake.

use serde::Serialize;
use serde_json::{json, Value};

/// Sample rate assumed when the client does not declare one.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Bit depth sent upstream. Fixed.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Channel count sent upstream. Fixed.
pub const CHANNELS: u16 = 1;

/// Container/codec pair understood by the recognition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub format: &'static str,
    pub codec: &'static str,
}

impl AudioFormat {
    /// Map a browser mime type (e.g. `audio/webm;codecs=opus`) to a format.
    /// Unknown or missing types are treated as raw PCM.
    pub fn from_mime(mime: Option<&str>) -> Self {
        let essence = mime
            .and_then(|m| m.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let (format, codec) = match essence.as_str() {
            "audio/ogg" => ("ogg", "opus"),
            "audio/webm" => ("webm", "opus"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => ("wav", "raw"),
            "audio/mpeg" | "audio/mp3" => ("mp3", "raw"),
            _ => ("pcm", "raw"),
        };
        Self { format, codec }
    }
}

/// Negotiated parameters for one transcription session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub user_id: String,
    pub language: Option<String>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub model_name: String,
}

impl SessionParams {
    pub fn new(
        user_id: impl Into<String>,
        language: Option<String>,
        mime_type: Option<&str>,
        sample_rate: Option<u32>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            language: language.filter(|l| !l.is_empty()),
            format: AudioFormat::from_mime(mime_type),
            sample_rate: sample_rate.filter(|r| *r > 0).unwrap_or(DEFAULT_SAMPLE_RATE),
            model_name: model_name.into(),
        }
    }

    /// JSON body of the full-client-request frame.
    pub fn request_payload(&self) -> Value {
        let mut audio = json!({
            "format": self.format.format,
            "codec": self.format.codec,
            "rate": self.sample_rate,
            "bits": BITS_PER_SAMPLE,
            "channel": CHANNELS,
        });
        if let Some(language) = &self.language {
            audio["language"] = json!(language);
        }

        json!({
            "user": { "uid": self.user_id },
            "audio": audio,
            "request": {
                "model_name": self.model_name,
                "enable_itn": true,
                "enable_punc": true,
                "show_utterances": true,
                "result_type": "full",
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_mapping() {
        assert_eq!(
            AudioFormat::from_mime(Some("audio/webm;codecs=opus")),
            AudioFormat { format: "webm", codec: "opus" }
        );
        assert_eq!(AudioFormat::from_mime(Some("Audio/OGG")).format, "ogg");
        assert_eq!(AudioFormat::from_mime(Some("audio/x-wav")).format, "wav");
        assert_eq!(AudioFormat::from_mime(Some("audio/mpeg")).format, "mp3");
        assert_eq!(
            AudioFormat::from_mime(None),
            AudioFormat { format: "pcm", codec: "raw" }
        );
    }

    #[test]
    fn request_payload_shape() {
        let params = SessionParams::new(
            "user-1",
            Some("en-US".into()),
            Some("audio/ogg;codecs=opus"),
            Some(48_000),
            "bigmodel",
        );
        let payload = params.request_payload();
        assert_eq!(payload["user"]["uid"], "user-1");
        assert_eq!(payload["audio"]["format"], "ogg");
        assert_eq!(payload["audio"]["codec"], "opus");
        assert_eq!(payload["audio"]["rate"], 48_000);
        assert_eq!(payload["audio"]["bits"], 16);
        assert_eq!(payload["audio"]["channel"], 1);
        assert_eq!(payload["audio"]["language"], "en-US");
        assert_eq!(payload["request"]["enable_itn"], true);
        assert_eq!(payload["request"]["enable_punc"], true);
        assert_eq!(payload["request"]["show_utterances"], true);
    }

    #[test]
    fn defaults_for_missing_fields() {
        let params = SessionParams::new("u", Some(String::new()), None, Some(0), "bigmodel");
        assert_eq!(params.sample_rate, DEFAULT_SAMPLE_RATE);
        assert!(params.request_payload()["audio"].get("language").is_none());
    }
}
