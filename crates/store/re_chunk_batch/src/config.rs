use crate::{ConfigError, ConfigResult};

/// Sizing of batched chunk iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchIteratorConfig {
    /// How many chunk references are fetched per batch, not counting the ones carried over from
    /// the previous batch.
    ///
    /// See [`Self::ENV_CHUNK_BATCH_SIZE`].
    pub batch_size: usize,

    /// The largest batch size the batch-size histogram is expected to see.
    ///
    /// See [`Self::ENV_CHUNK_MAX_BATCH_SIZE`].
    pub max_batch_size: usize,
}

impl Default for BatchIteratorConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BatchIteratorConfig {
    pub const DEFAULT: Self = Self {
        batch_size: 50,
        max_batch_size: 50,
    };

    /// Environment variable to configure [`Self::batch_size`].
    pub const ENV_CHUNK_BATCH_SIZE: &'static str = "RERUN_CHUNK_BATCH_SIZE";

    /// Environment variable to configure [`Self::max_batch_size`].
    pub const ENV_CHUNK_MAX_BATCH_SIZE: &'static str = "RERUN_CHUNK_MAX_BATCH_SIZE";

    /// [`Self::DEFAULT`], overridden by the environment.
    #[inline]
    pub fn from_env() -> ConfigResult<Self> {
        Self::DEFAULT.apply_env()
    }

    /// Returns a copy of `self`, overridden by the environment variables, if set.
    pub fn apply_env(&self) -> ConfigResult<Self> {
        let mut new = *self;

        if let Some(batch_size) = read_env(Self::ENV_CHUNK_BATCH_SIZE)? {
            new.batch_size = batch_size;
        }

        if let Some(max_batch_size) = read_env(Self::ENV_CHUNK_MAX_BATCH_SIZE)? {
            new.max_batch_size = max_batch_size;
        }

        Ok(new)
    }
}

fn read_env(name: &'static str) -> ConfigResult<Option<usize>> {
    let Ok(value) = std::env::var(name) else {
        return Ok(None);
    };
    parse_positive(name, &value).map(Some)
}

fn parse_positive(name: &'static str, value: &str) -> ConfigResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        Ok(_) | Err(_) => Err(ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
        }),
    }
}
