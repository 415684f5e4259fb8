use super::Message;

/// How a receiver learns the length of an indirection payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthMode {
    /// A fixed-size header precedes every payload.
    #[default]
    Prefix,
    /// The payload is sent alone; the receiver probes its length first.
    Probe,
}

/// Settings shared by both peers of a message. Sender and receiver must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageConfig {
    pub verify_manifest: bool,
    pub length_mode: LengthMode,
    /// Largest single allocation a receiver will make for one indirection.
    pub max_allocation: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            verify_manifest: false,
            length_mode: LengthMode::Prefix,
            max_allocation: 1 << 30, // 1GB
        }
    }
}

#[derive(Default)]
pub struct MessageBuilder {
    config: MessageConfig,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange a manifest preamble and reject peers whose layout differs.
    pub fn with_manifest_check(mut self, enabled: bool) -> Self {
        self.config.verify_manifest = enabled;
        self
    }

    pub fn with_length_mode(mut self, mode: LengthMode) -> Self {
        self.config.length_mode = mode;
        self
    }

    pub fn with_max_allocation(mut self, bytes: usize) -> Self {
        self.config.max_allocation = bytes;
        self
    }

    pub fn config(&self) -> MessageConfig {
        self.config
    }

    pub fn build<'a>(self) -> Message<'a> {
        Message::with_config(self.config)
    }
}
