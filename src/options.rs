use std::time::Duration;

pub(crate) const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(100);

/// Options shared by every queue implementation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Name used to identify the queue in logs.
    pub name: String,
    /// Maximum number of unconsumed messages the queue will hold. Posting past this limit fails
    /// with [`QueueFull`] so producers can apply backpressure.
    ///
    /// [`QueueFull`]: crate::MqError::QueueFull
    pub max_size: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { name: String::from("queue"), max_size: None }
    }
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// What a reader does after its backend reported an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Stop the reader, as if [`Reader::stop`] had been called.
    ///
    /// [`Reader::stop`]: crate::Reader::stop
    #[default]
    Stop,
    /// Keep reading after waiting for the idle delay.
    Continue,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Subscription name, used in logs and handed to handlers through their delivery context.
    pub name: String,
    /// How long a polling reader waits after finding its queue empty, or after a failed
    /// delivery, before trying again.
    #[serde(with = "millis")]
    pub idle_delay: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self { name: String::from("reader"), idle_delay: DEFAULT_IDLE_DELAY }
    }
}

impl ReaderOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }
}

mod millis {
    use serde::Deserialize;

    pub(super) fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<std::time::Duration, D::Error> {
        u64::deserialize(d).map(std::time::Duration::from_millis)
    }
}
