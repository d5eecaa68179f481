/// Error kinds the app shell and rebuild path distinguish between (§7).
///
/// `Validation` and `StateConsistency` are recovered from locally and never
/// propagate past the rebuild boundary; `SdkTransient` degrades a single
/// device; `Fatal` is the only variant that reaches `main`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("sdk transient error on device {device_id}: {source}")]
    SdkTransient {
        device_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("state consistency: {0} (defaults substituted)")]
    StateConsistency(String),

    #[error("fatal startup: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl CoreError {
    pub fn sdk_transient(device_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::SdkTransient {
            device_id: device_id.into(),
            source,
        }
    }
}
