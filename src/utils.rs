use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};
use tracing::warn;

use crate::name::Provider;

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

fn seconds_from_env(var: &str, default: f32) -> Duration {
    let seconds = env::var(var)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
        .max(0.1f32);
    Duration::from_secs_f32(seconds)
}

/// How long to wait for channels to connect, from environment or default 5s
pub fn get_default_connection_timeout() -> Duration {
    seconds_from_env("EPICS_PVA_CONN_TMO", 5.0)
}

/// How long to wait for get and put replies, from environment or default 5s
pub fn get_default_io_timeout() -> Duration {
    seconds_from_env("EPICS_PVA_IO_TMO", 5.0)
}

/// The provider used for names without a `pva://` or `ca://` prefix
pub fn get_default_provider() -> Provider {
    match env::var("EPICS_DEFAULT_PROVIDER") {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            warn!("Ignoring EPICS_DEFAULT_PROVIDER: {e}");
            Provider::default()
        }),
        Err(_) => Provider::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_add_returns_previous() {
        let mut id = u8::MAX - 1;
        assert_eq!(wrapping_inplace_add(&mut id), u8::MAX - 1);
        assert_eq!(wrapping_inplace_add(&mut id), u8::MAX);
        assert_eq!(id, 0);
    }

    #[test]
    fn timeouts_have_a_floor() {
        assert!(get_default_connection_timeout() >= Duration::from_millis(100));
        assert!(get_default_io_timeout() >= Duration::from_millis(100));
    }
}
