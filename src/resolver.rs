//! Configuration resolver.
//!
//! Turns a [`CameraConfiguration`] plus the connected device's
//! [`DeviceCapabilities`] into an ordered list of [`DeviceParameter`] setter
//! calls. Resolution is a pure function of its inputs: the same document and
//! capability table always produce the same operations in the same order.
//!
//! ```text
//!  CameraConfiguration ──┐
//!                        ├──► validate ──► resolve labels ──► Resolution
//!  DeviceCapabilities ───┘                                   ├─ operations (canonical order)
//!                                                            └─ warnings
//! ```
//!
//! Canonical order: fan, acquisition mode (+ kinetic series), trigger, read
//! mode, exposure, EM gain, shutter, frame transfer, amplifier mode, vertical
//! shift speed, temperature setpoint.
//!
//! An amplifier triple with no exact match in the device table, or with a
//! label the resolver does not recognize, is not an error: the resolver falls back to a safe default mode and records a
//! [`ResolutionWarning`]. An unknown vertical shift label falls back to index 0
//! the same way.

use crate::camera_config::{CameraConfiguration, HorizontalShift};
use crate::error::{AppResult, CameraError};
use crate::hardware::andor_sdk::{
    AcquisitionMode, AmpMode, DeviceCapabilities, DeviceParameter, FanMode, ReadMode,
    ShutterMode, TriggerMode,
};
use std::fmt;

/// Vertical shift labels in device table order.
const VS_SPEED_LABELS: [&str; 4] = ["0.6", "1.13", "2.2", "4.33"];

/// Resolver tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Amplifier table index used when no exact match exists. `None` uses the
    /// device-reported factory default.
    pub fallback_amp_mode: Option<usize>,
}

/// Non-fatal resolution outcome that leaves the camera in a degraded state.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionWarning {
    /// The requested amplifier triple is not in the device table.
    AmbiguousAmplifierMode {
        requested: HorizontalShift,
        fallback: AmpMode,
    },
    /// The vertical shift label is unknown or beyond the device table.
    UnknownVerticalSpeed { selector: String, fallback_index: usize },
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionWarning::AmbiguousAmplifierMode {
                requested,
                fallback,
            } => write!(
                f,
                "no amplifier mode matches {} / {} / {}; using {}",
                requested.readout_rate, requested.pre_amp_gain, requested.output_amp, fallback
            ),
            ResolutionWarning::UnknownVerticalSpeed {
                selector,
                fallback_index,
            } => write!(
                f,
                "unknown vertical shift speed '{selector}'; using index {fallback_index}"
            ),
        }
    }
}

/// Ordered device operations plus any fallbacks taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub operations: Vec<DeviceParameter>,
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    /// True when a fallback was used for any setting.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

fn invalid(field: &str, value: impl fmt::Display) -> CameraError {
    CameraError::InvalidConfig {
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn normalize(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Parses "single" / "kinetic".
pub fn parse_acquisition_mode(label: &str) -> AppResult<AcquisitionMode> {
    match normalize(label).as_str() {
        "single" | "singlescan" => Ok(AcquisitionMode::SingleScan),
        "kinetic" | "kinetics" => Ok(AcquisitionMode::Kinetic),
        _ => Err(invalid("acquisitionMode", label)),
    }
}

fn parse_trigger(label: &str) -> AppResult<TriggerMode> {
    match normalize(label).as_str() {
        "internal" | "int" => Ok(TriggerMode::Internal),
        "external" | "ext" => Ok(TriggerMode::External),
        "software" => Ok(TriggerMode::Software),
        _ => Err(invalid("triggering", label)),
    }
}

fn parse_read_mode(label: &str) -> AppResult<ReadMode> {
    match normalize(label).as_str() {
        "image" => Ok(ReadMode::Image),
        "fvb" | "fullverticalbinning" => Ok(ReadMode::FullVerticalBinning),
        _ => Err(invalid("readoutMode", label)),
    }
}

fn parse_shutter(label: &str) -> AppResult<ShutterMode> {
    match normalize(label).as_str() {
        "auto" | "fullauto" => Ok(ShutterMode::Auto),
        "open" => Ok(ShutterMode::Open),
        "close" | "closed" => Ok(ShutterMode::Closed),
        _ => Err(invalid("shutter", label)),
    }
}

fn parse_fan(label: &str) -> AppResult<FanMode> {
    match normalize(label).as_str() {
        "full" => Ok(FanMode::Full),
        "low" => Ok(FanMode::Low),
        "off" => Ok(FanMode::Off),
        _ => Err(invalid("fanLevel", label)),
    }
}

fn parse_readout_rate(label: &str) -> Option<u16> {
    match normalize(label).as_str() {
        "30mhz" => Some(0),
        "20mhz" => Some(1),
        "10mhz" => Some(2),
        "1mhz" => Some(3),
        _ => None,
    }
}

fn parse_preamp(label: &str) -> Option<u16> {
    match normalize(label).as_str() {
        "gain1" => Some(0),
        "gain2" => Some(1),
        "gain3" => Some(2),
        _ => None,
    }
}

fn parse_output_amp(label: &str) -> Option<u16> {
    match normalize(label).as_str() {
        "em" => Some(0),
        "conventional" | "conv" => Some(1),
        _ => None,
    }
}

/// Looks up the amplifier triple by exact linear scan; first match wins.
///
/// An unrecognized label anywhere in the triple counts as no match, so this
/// only fails when the device reports an empty amplifier table.
fn resolve_amp_mode(
    shift: &HorizontalShift,
    caps: &DeviceCapabilities,
    options: &ResolverOptions,
    warnings: &mut Vec<ResolutionWarning>,
) -> AppResult<AmpMode> {
    let wanted = match (
        parse_output_amp(&shift.output_amp),
        parse_readout_rate(&shift.readout_rate),
        parse_preamp(&shift.pre_amp_gain),
    ) {
        (Some(output_amp), Some(hs_speed), Some(preamp)) => Some(AmpMode {
            channel: 0,
            output_amp,
            hs_speed,
            preamp,
        }),
        _ => None,
    };

    if let Some(mode) = wanted.and_then(|wanted| caps.amp_modes.iter().find(|mode| **mode == wanted)) {
        return Ok(*mode);
    }

    let fallback = options
        .fallback_amp_mode
        .and_then(|index| caps.amp_modes.get(index).copied())
        .or_else(|| caps.default_amp())
        .ok_or_else(|| invalid("horizontalShift", "device reports no amplifier modes"))?;

    let warning = ResolutionWarning::AmbiguousAmplifierMode {
        requested: shift.clone(),
        fallback,
    };
    tracing::warn!("{}", warning);
    warnings.push(warning);
    Ok(fallback)
}

fn resolve_vs_speed(
    selector: &str,
    caps: &DeviceCapabilities,
    warnings: &mut Vec<ResolutionWarning>,
) -> usize {
    let label = selector.trim();
    match VS_SPEED_LABELS.iter().position(|known| *known == label) {
        Some(index) if index < caps.vs_speeds.len() => index,
        _ => {
            let warning = ResolutionWarning::UnknownVerticalSpeed {
                selector: selector.to_string(),
                fallback_index: 0,
            };
            tracing::warn!("{}", warning);
            warnings.push(warning);
            0
        }
    }
}

/// Validates `config` against `caps` and returns the ordered device operations.
///
/// No device is touched; validation failures return `InvalidConfig` or
/// `InvalidTiming` before any operation is produced.
pub fn resolve(
    config: &CameraConfiguration,
    caps: &DeviceCapabilities,
    options: &ResolverOptions,
) -> AppResult<Resolution> {
    let fan = parse_fan(&config.fan_level)?;
    let mode = parse_acquisition_mode(&config.acquisition_mode)?;
    let trigger = parse_trigger(&config.triggering)?;
    let read_mode = parse_read_mode(&config.readout_mode)?;
    let shutter = parse_shutter(&config.shutter)?;

    if !(config.exposure_time.is_finite() && config.exposure_time > 0.0) {
        return Err(invalid("exposureTime", config.exposure_time));
    }

    let kinetic = match mode {
        AcquisitionMode::SingleScan => None,
        AcquisitionMode::Kinetic => {
            let series_length = config
                .series_length
                .ok_or_else(|| invalid("seriesLength", "missing"))?;
            let cycle_time = config
                .cycle_time
                .ok_or_else(|| invalid("cycleTime", "missing"))?;
            let accumulations = config
                .accumulation_count
                .ok_or_else(|| invalid("accumulationCount", "missing"))?;
            if series_length == 0 {
                return Err(invalid("seriesLength", series_length));
            }
            if accumulations == 0 {
                return Err(invalid("accumulationCount", accumulations));
            }
            if !cycle_time.is_finite() {
                return Err(invalid("cycleTime", cycle_time));
            }
            let minimum = config.exposure_time + caps.readout_overhead.as_secs_f64();
            if cycle_time < minimum {
                return Err(CameraError::InvalidTiming {
                    cycle_time,
                    minimum,
                });
            }
            Some(DeviceParameter::KineticSeries {
                series_length,
                cycle_time,
                accumulations,
            })
        }
    };

    let (gain_min, gain_max) = caps.em_gain_range;
    let em_gain = if config.em_gain.enabled {
        let level = config.em_gain.level;
        if level < i64::from(gain_min) || level > i64::from(gain_max) {
            return Err(invalid(
                "emGain.level",
                format!("{level} (device range {gain_min}..={gain_max})"),
            ));
        }
        level as u32
    } else {
        gain_min
    };

    let mut warnings = Vec::new();
    let amp_mode = resolve_amp_mode(&config.horizontal_shift, caps, options, &mut warnings)?;
    let vs_speed = resolve_vs_speed(&config.vertical_shift.speed_selector, caps, &mut warnings);

    let mut operations = vec![
        DeviceParameter::FanMode(fan),
        DeviceParameter::AcquisitionMode(mode),
    ];
    operations.extend(kinetic);
    operations.extend([
        DeviceParameter::TriggerMode(trigger),
        DeviceParameter::ReadMode(read_mode),
        DeviceParameter::Exposure(config.exposure_time),
        DeviceParameter::EmGain(em_gain),
        DeviceParameter::Shutter(shutter),
        DeviceParameter::FrameTransfer(config.frame_transfer),
        DeviceParameter::AmpMode(amp_mode),
        DeviceParameter::VsSpeed(vs_speed),
        DeviceParameter::TemperatureSetpoint(config.temperature_setpoint),
    ]);

    Ok(Resolution {
        operations,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::andor_sdk::ParameterKind;
    use crate::hardware::mock::ixon_capabilities;

    fn single_config() -> CameraConfiguration {
        CameraConfiguration {
            acquisition_mode: "single".to_string(),
            series_length: None,
            cycle_time: None,
            accumulation_count: None,
            ..CameraConfiguration::default()
        }
    }

    fn kinds(resolution: &Resolution) -> Vec<ParameterKind> {
        resolution.operations.iter().map(|op| op.kind()).collect()
    }

    #[test]
    fn test_canonical_order_kinetic() {
        let resolution = resolve(
            &CameraConfiguration::default(),
            &ixon_capabilities(),
            &ResolverOptions::default(),
        )
        .unwrap();
        assert_eq!(
            kinds(&resolution),
            vec![
                ParameterKind::FanMode,
                ParameterKind::AcquisitionMode,
                ParameterKind::KineticSeries,
                ParameterKind::TriggerMode,
                ParameterKind::ReadMode,
                ParameterKind::Exposure,
                ParameterKind::EmGain,
                ParameterKind::Shutter,
                ParameterKind::FrameTransfer,
                ParameterKind::AmpMode,
                ParameterKind::VsSpeed,
                ParameterKind::TemperatureSetpoint,
            ]
        );
        assert!(!resolution.is_degraded());
    }

    #[test]
    fn test_single_mode_has_no_kinetic_setup() {
        let resolution = resolve(
            &single_config(),
            &ixon_capabilities(),
            &ResolverOptions::default(),
        )
        .unwrap();
        assert!(!kinds(&resolution).contains(&ParameterKind::KineticSeries));
        assert_eq!(resolution.operations.len(), 11);
    }

    #[test]
    fn test_label_spellings() {
        let mut config = single_config();
        config.shutter = "fullauto".to_string();
        config.triggering = "int".to_string();
        config.horizontal_shift.readout_rate = "10MHz".to_string();
        config.horizontal_shift.pre_amp_gain = "gain2".to_string();
        let resolution =
            resolve(&config, &ixon_capabilities(), &ResolverOptions::default()).unwrap();

        assert!(resolution
            .operations
            .contains(&DeviceParameter::Shutter(ShutterMode::Auto)));
        assert!(resolution
            .operations
            .contains(&DeviceParameter::TriggerMode(TriggerMode::Internal)));
        assert!(resolution.operations.contains(&DeviceParameter::AmpMode(AmpMode {
            channel: 0,
            output_amp: 0,
            hs_speed: 2,
            preamp: 1,
        })));
    }

    #[test]
    fn test_unknown_enum_is_invalid_config() {
        let mut config = single_config();
        config.triggering = "telepathic".to_string();
        match resolve(&config, &ixon_capabilities(), &ResolverOptions::default()) {
            Err(CameraError::InvalidConfig { field, value }) => {
                assert_eq!(field, "triggering");
                assert_eq!(value, "telepathic");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_em_gain_out_of_range_rejected() {
        let mut config = single_config();
        config.em_gain.level = 301;
        let err = resolve(&config, &ixon_capabilities(), &ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, CameraError::InvalidConfig { ref field, .. } if field == "emGain.level"));

        config.em_gain.level = -1;
        assert!(resolve(&config, &ixon_capabilities(), &ResolverOptions::default()).is_err());
    }

    #[test]
    fn test_em_gain_disabled_uses_device_minimum() {
        let mut config = single_config();
        config.em_gain = crate::camera_config::EmGainSettings {
            enabled: false,
            level: 5000,
        };
        let resolution =
            resolve(&config, &ixon_capabilities(), &ResolverOptions::default()).unwrap();
        assert!(resolution.operations.contains(&DeviceParameter::EmGain(0)));
    }

    #[test]
    fn test_cycle_time_shorter_than_exposure_plus_readout() {
        let mut config = CameraConfiguration::default();
        config.exposure_time = 0.04;
        config.cycle_time = Some(0.0405);
        let err = resolve(&config, &ixon_capabilities(), &ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, CameraError::InvalidTiming { .. }));

        config.cycle_time = Some(0.05);
        assert!(resolve(&config, &ixon_capabilities(), &ResolverOptions::default()).is_ok());
    }

    #[test]
    fn test_kinetic_requires_series_fields() {
        let mut config = CameraConfiguration::default();
        config.series_length = None;
        let err = resolve(&config, &ixon_capabilities(), &ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, CameraError::InvalidConfig { ref field, .. } if field == "seriesLength"));
    }

    #[test]
    fn test_fallback_override_index() {
        let mut config = single_config();
        config.horizontal_shift.output_amp = "Conventional".to_string();
        config.horizontal_shift.readout_rate = "30 MHz".to_string();
        let caps = ixon_capabilities();

        // Conventional amp has no 1 MHz entry at hs index 3, but 30 MHz (index 0) exists.
        let exact = resolve(&config, &caps, &ResolverOptions::default()).unwrap();
        assert!(!exact.is_degraded());

        config.horizontal_shift.readout_rate = "1 MHz".to_string();
        let options = ResolverOptions {
            fallback_amp_mode: Some(2),
        };
        let degraded = resolve(&config, &caps, &options).unwrap();
        assert_eq!(degraded.warnings.len(), 1);
        assert!(degraded
            .operations
            .contains(&DeviceParameter::AmpMode(caps.amp_modes[2])));
    }

    #[test]
    fn test_vs_label_beyond_device_table() {
        let mut caps = ixon_capabilities();
        caps.vs_speeds = vec![0.6, 1.13];
        let mut config = single_config();
        config.vertical_shift.speed_selector = "4.33".to_string();
        let resolution = resolve(&config, &caps, &ResolverOptions::default()).unwrap();
        assert!(resolution.operations.contains(&DeviceParameter::VsSpeed(0)));
        assert_eq!(
            resolution.warnings,
            vec![ResolutionWarning::UnknownVerticalSpeed {
                selector: "4.33".to_string(),
                fallback_index: 0
            }]
        );
    }
}
