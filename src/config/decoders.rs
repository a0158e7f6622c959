//! Decoder catalog: named stage pipelines with parameter placeholders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::process::StageSpec;

/// A configured decoder: the stages to launch and parameter defaults.
///
/// Stage commands and arguments may contain `{name}` placeholders that are
/// filled from start parameters, falling back to `defaults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub description: String,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

impl DecoderConfig {
    /// Build the stage list with every placeholder substituted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingParameter` for the first placeholder that
    /// has neither a parameter nor a default.
    pub fn resolve(
        &self,
        decoder: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<Vec<StageSpec>, ConfigError> {
        let mut missing: Option<String> = None;

        let mut substitute = |text: &str| -> String {
            placeholder()
                .replace_all(text, |caps: &Captures| {
                    let key = &caps[1];
                    if let Some(value) = parameters.get(key).or_else(|| self.defaults.get(key)) {
                        value.clone()
                    } else {
                        missing.get_or_insert_with(|| key.to_string());
                        caps[0].to_string()
                    }
                })
                .into_owned()
        };

        let stages: Vec<StageSpec> = self
            .stages
            .iter()
            .map(|stage| StageSpec {
                id: stage.id.clone(),
                command: substitute(&stage.command),
                args: stage.args.iter().map(|arg| substitute(arg)).collect(),
                pipe_from_previous: stage.pipe_from_previous,
            })
            .collect();

        match missing {
            Some(parameter) => Err(ConfigError::MissingParameter {
                decoder: decoder.to_string(),
                parameter,
            }),
            None => Ok(stages),
        }
    }

    /// Names of every placeholder used by the stages.
    #[must_use]
    pub fn parameters(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .flat_map(|stage| std::iter::once(&stage.command).chain(&stage.args))
            .flat_map(|text| placeholder().captures_iter(text))
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Whether every stage's executable is installed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.stages.iter().all(StageSpec::is_available)
    }
}

fn defaults(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Decoders available when no configuration file defines any.
#[must_use]
pub fn builtin_decoders() -> BTreeMap<String, DecoderConfig> {
    let mut decoders = BTreeMap::new();

    decoders.insert(
        "pager".to_string(),
        DecoderConfig {
            description: "POCSAG/FLEX pager decoding".to_string(),
            stages: vec![
                StageSpec::new("capture", "rtl_fm").args([
                    "-d",
                    "{device}",
                    "-f",
                    "{frequency}",
                    "-M",
                    "fm",
                    "-s",
                    "22050",
                    "-g",
                    "{gain}",
                    "-",
                ]),
                StageSpec::new("decoder", "multimon-ng")
                    .args([
                        "-t",
                        "raw",
                        "-a",
                        "POCSAG512",
                        "-a",
                        "POCSAG1200",
                        "-a",
                        "POCSAG2400",
                        "-a",
                        "FLEX",
                        "-f",
                        "alpha",
                        "-",
                    ])
                    .piped(),
            ],
            defaults: defaults(&[("device", "0"), ("frequency", "153.350M"), ("gain", "40")]),
        },
    );

    decoders.insert(
        "adsb".to_string(),
        DecoderConfig {
            description: "ADS-B aircraft frames".to_string(),
            stages: vec![StageSpec::new("receiver", "dump1090").args([
                "--device-index",
                "{device}",
                "--raw",
            ])],
            defaults: defaults(&[("device", "0")]),
        },
    );

    decoders.insert(
        "bluetooth".to_string(),
        DecoderConfig {
            description: "BLE advertisements via Ubertooth".to_string(),
            stages: vec![StageSpec::new("scanner", "ubertooth-btle").args(["-n", "-U", "{device}"])],
            defaults: defaults(&[("device", "0")]),
        },
    );

    decoders.insert(
        "gsm".to_string(),
        DecoderConfig {
            description: "GSM downlink monitoring".to_string(),
            stages: vec![
                StageSpec::new("livemon", "grgsm_livemon_headless").args([
                    "-f",
                    "{frequency}",
                    "-g",
                    "{gain}",
                ]),
                StageSpec::new("monitor", "tshark").args([
                    "-i",
                    "lo",
                    "-l",
                    "-Y",
                    "gsmtap",
                    "-T",
                    "fields",
                    "-e",
                    "gsm_a.tmsi",
                    "-e",
                    "e212.imsi",
                ]),
            ],
            defaults: defaults(&[("frequency", "925.8M"), ("gain", "40")]),
        },
    );

    decoders
}
