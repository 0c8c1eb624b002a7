//! Settings types with compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.courier/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Broker behavior.
    pub broker: BrokerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()
    }
}

/// Broker tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// How long a relayed request waits for the destination to answer
    /// before the origin is completed with an empty payload.
    pub relay_timeout_ms: u64,
    /// Outbound queue depth per channel. Sends beyond it are dropped.
    pub channel_capacity: usize,
    /// Retire pending relays as soon as their origin channel disconnects
    /// instead of waiting for the reply or the timeout.
    pub evict_on_origin_disconnect: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            relay_timeout_ms: 1023,
            channel_capacity: 256,
            evict_on_origin_disconnect: false,
        }
    }
}

impl BrokerSettings {
    /// Relay timeout as a [`Duration`].
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// Reject zero timeouts and zero-capacity queues.
    pub fn validate(&self) -> Result<()> {
        if self.relay_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.relayTimeoutMs must be greater than 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.channelCapacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn broker_defaults() {
        let s = BrokerSettings::default();
        assert_eq!(s.relay_timeout_ms, 1023);
        assert_eq!(s.relay_timeout(), Duration::from_millis(1023));
        assert_eq!(s.channel_capacity, 256);
        assert!(!s.evict_on_origin_disconnect);
    }

    #[test]
    fn logging_defaults() {
        let s = LoggingSettings::default();
        assert_eq!(s.level, "warn");
        assert!(!s.json);
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(CourierSettings::default()).unwrap();
        assert_eq!(v["broker"]["relayTimeoutMs"], 1023);
        assert_eq!(v["broker"]["channelCapacity"], 256);
        assert_eq!(v["broker"]["evictOnOriginDisconnect"], false);
        assert_eq!(v["logging"]["level"], "warn");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: CourierSettings =
            serde_json::from_str(r#"{"broker":{"relayTimeoutMs":50}}"#).unwrap();
        assert_eq!(s.broker.relay_timeout_ms, 50);
        assert_eq!(s.broker.channel_capacity, 256);
        assert_eq!(s.logging, LoggingSettings::default());
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let s = BrokerSettings {
            relay_timeout_ms: 0,
            ..BrokerSettings::default()
        };
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("relayTimeoutMs"));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let s = CourierSettings {
            broker: BrokerSettings {
                channel_capacity: 0,
                ..BrokerSettings::default()
            },
            ..CourierSettings::default()
        };
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn defaults_validate() {
        assert!(CourierSettings::default().validate().is_ok());
    }
}
