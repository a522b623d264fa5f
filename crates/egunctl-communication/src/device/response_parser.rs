//! Controller reply parser
//!
//! Classifies one frame payload (the text between the `$$$` marker and
//! the line feed) into a [`DeviceEvent`]. Matching is by literal,
//! case-sensitive prefix at position 0.
//!
//! Malformed numeric fields make the parser return `None` for that single
//! message; they are logged and never escalate.

use egunctl_core::{
    DeviceEvent, PsuMode, RampDurations, RampSteps, SupplyLimits, TargetVoltages,
};
use std::str::FromStr;

/// Reply parser for the electron source controller
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseParser;

fn number<T: FromStr>(field: &str) -> Option<T> {
    field.trim().parse().ok()
}

/// Split `body` on `:` into exactly `N` floats
fn floats<const N: usize>(body: &str) -> Option<[f64; N]> {
    let parts: Vec<&str> = body.split(':').collect();
    if parts.len() != N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = number(part)?;
    }
    Some(out)
}

/// Four flag characters following a fixed prefix
fn flags(body: &str) -> Option<[char; 4]> {
    let mut chars = body.chars();
    let mut out = ['\0'; 4];
    for slot in out.iter_mut() {
        *slot = chars.next()?;
    }
    Some(out)
}

impl ResponseParser {
    /// Create a new parser
    pub fn new() -> Self {
        Self
    }

    /// Parse one frame payload.
    ///
    /// Returns `None` for messages that are deliberately ignored and for
    /// recognised messages whose fields do not parse. Anything that
    /// matches no known prefix becomes [`DeviceEvent::Unknown`].
    pub fn parse(&self, payload: &str) -> Option<DeviceEvent> {
        let event = self.classify(payload);
        if event.is_none() {
            tracing::debug!("Discarded device message '{}'", payload);
        }
        event
    }

    fn classify(&self, msg: &str) -> Option<DeviceEvent> {
        let bytes = msg.as_bytes();

        if msg.starts_with("electronctrl") {
            let mut parts = msg.split('_').skip(1);
            let version_date = parts.next()?.to_string();
            let version_rev = parts.next()?.to_string();
            return Some(DeviceEvent::Identify {
                version_date,
                version_rev,
            });
        }

        // Reserved for newer controller firmware
        if msg.starts_with("id:") || msg.starts_with("ver:") {
            return None;
        }

        if msg.starts_with("beamon") {
            return Some(DeviceEvent::BeamOn);
        }

        if msg.starts_with("insulok") {
            return Some(DeviceEvent::InsulationOk);
        }

        if let Some(rest) = msg.strip_prefix("insulfailed") {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            let failed_channels = flags(rest)?
                .iter()
                .zip(1u8..)
                .filter(|(flag, _)| **flag == 'F')
                .map(|(_, ch)| ch)
                .collect();
            return Some(DeviceEvent::InsulationFailed { failed_channels });
        }

        if bytes.len() > 2 && bytes[2] == b':' && (bytes[0] == b'v' || bytes[0] == b'a') {
            let value = &msg[3..];
            if bytes[0] == b'a' && bytes[1] == b'f' {
                let value: i64 = number(value)?;
                return Some(DeviceEvent::FilamentCurrent {
                    value: value as f64,
                });
            }

            let channel = char::from(bytes[1]).to_digit(10)? as u8;
            let raw: i64 = number(value)?;
            return Some(if bytes[0] == b'v' {
                DeviceEvent::Voltage {
                    channel,
                    value: raw,
                }
            } else {
                // Tenths of a microamp
                DeviceEvent::Current {
                    channel,
                    value: raw as f64 / 10.0,
                }
            });
        }

        if let Some(rest) = msg.strip_prefix("psustate") {
            let modes = flags(rest)?.map(PsuMode::from_flag);
            return Some(DeviceEvent::PsuModes { modes });
        }

        if let Some(rest) = msg.strip_prefix("filseta:") {
            let field = rest.split(':').next().unwrap_or(rest);
            if field == "disabled" {
                return Some(DeviceEvent::FilamentCurrentSet { value: None });
            }
            return Some(DeviceEvent::FilamentCurrentSet {
                value: Some(number(field)?),
            });
        }

        if msg.starts_with("off") {
            return Some(DeviceEvent::Off);
        }

        if let Some(rest) = msg.strip_prefix("ra:") {
            return Some(DeviceEvent::FilamentCurrent {
                value: number(rest)?,
            });
        }

        if let Some(rest) = msg.strip_prefix("adc0:") {
            return Some(DeviceEvent::AdcRaw {
                value: number(rest)?,
            });
        }

        if let Some(rest) = msg.strip_prefix("vtargets:") {
            let [cathode, wehnelt, wehnelt_blank, focus] = floats::<4>(rest)?;
            return Some(DeviceEvent::TargetVoltages(TargetVoltages {
                cathode,
                wehnelt,
                wehnelt_blank,
                focus,
            }));
        }

        if let Some(rest) = msg.strip_prefix("beamcurlim:") {
            return Some(DeviceEvent::CurrentLimitBeam(supply_limits(rest)?));
        }

        if let Some(rest) = msg.strip_prefix("insulcurlim:") {
            return Some(DeviceEvent::CurrentLimitInsulation(supply_limits(rest)?));
        }

        if let Some(rest) = msg.strip_prefix("rampsteps:") {
            let [volts, filament_amps] = floats::<2>(rest)?;
            return Some(DeviceEvent::RampSteps(RampSteps {
                volts,
                filament_amps,
            }));
        }

        if let Some(rest) = msg.strip_prefix("rampdurations:") {
            let [voltage_step, filament_step, init] = floats::<3>(rest)?;
            return Some(DeviceEvent::RampDurations(RampDurations {
                voltage_step,
                filament_step,
                init,
            }));
        }

        tracing::info!("Unknown message {}", msg);
        Some(DeviceEvent::Unknown {
            raw: msg.to_string(),
        })
    }
}

fn supply_limits(body: &str) -> Option<SupplyLimits> {
    let [cathode, wehnelt, focus, aux] = floats::<4>(body)?;
    Some(SupplyLimits {
        cathode,
        wehnelt,
        focus,
        aux,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(msg: &str) -> Option<DeviceEvent> {
        ResponseParser::new().parse(msg)
    }

    #[test]
    fn test_parse_identify() {
        assert_eq!(
            parse("electronctrl_20231112_3"),
            Some(DeviceEvent::Identify {
                version_date: "20231112".to_string(),
                version_rev: "3".to_string(),
            })
        );
        assert_eq!(parse("electronctrl"), None);
    }

    #[test]
    fn test_parse_voltage_and_current() {
        assert_eq!(
            parse("v3:1808"),
            Some(DeviceEvent::Voltage {
                channel: 3,
                value: 1808
            })
        );
        assert_eq!(
            parse("a2:0150"),
            Some(DeviceEvent::Current {
                channel: 2,
                value: 15.0
            })
        );
        assert_eq!(parse("af:42"), Some(DeviceEvent::FilamentCurrent { value: 42.0 }));
    }

    #[test]
    fn test_malformed_numbers_are_swallowed() {
        assert_eq!(parse("v3:abc"), None);
        assert_eq!(parse("vx:100"), None);
        assert_eq!(parse("a1:"), None);
        assert_eq!(parse("vtargets:1:2:3"), None);
    }

    #[test]
    fn test_parse_insulation() {
        assert_eq!(parse("insulok"), Some(DeviceEvent::InsulationOk));
        assert_eq!(
            parse("insulfailed:F--F"),
            Some(DeviceEvent::InsulationFailed {
                failed_channels: vec![1, 4]
            })
        );
        assert_eq!(parse("insulfailed:F-"), None);
    }

    #[test]
    fn test_parse_psu_modes() {
        assert_eq!(
            parse("psustate-CVV"),
            Some(DeviceEvent::PsuModes {
                modes: [PsuMode::Off, PsuMode::Current, PsuMode::Voltage, PsuMode::Voltage]
            })
        );
    }

    #[test]
    fn test_parse_filament_set_point() {
        assert_eq!(
            parse("filseta:disabled"),
            Some(DeviceEvent::FilamentCurrentSet { value: None })
        );
        assert_eq!(
            parse("filseta:250"),
            Some(DeviceEvent::FilamentCurrentSet { value: Some(250) })
        );
    }

    #[test]
    fn test_parse_settings_replies() {
        assert_eq!(
            parse("vtargets:1800:1750:1500:900"),
            Some(DeviceEvent::TargetVoltages(TargetVoltages {
                cathode: 1800.0,
                wehnelt: 1750.0,
                wehnelt_blank: 1500.0,
                focus: 900.0,
            }))
        );
        assert_eq!(
            parse("beamcurlim:100:50:50:10 "),
            Some(DeviceEvent::CurrentLimitBeam(SupplyLimits {
                cathode: 100.0,
                wehnelt: 50.0,
                focus: 50.0,
                aux: 10.0,
            }))
        );
        assert_eq!(
            parse("rampdurations:1.5:2:30"),
            Some(DeviceEvent::RampDurations(RampDurations {
                voltage_step: 1.5,
                filament_step: 2.0,
                init: 30.0,
            }))
        );
        assert_eq!(parse("adc0:512"), Some(DeviceEvent::AdcRaw { value: 512.0 }));
    }

    #[test]
    fn test_ignored_and_unknown() {
        assert_eq!(parse("id:abc"), None);
        assert_eq!(parse("ver:2"), None);
        assert_eq!(parse("off"), Some(DeviceEvent::Off));
        assert_eq!(
            parse("hello"),
            Some(DeviceEvent::Unknown {
                raw: "hello".to_string()
            })
        );
    }
}
