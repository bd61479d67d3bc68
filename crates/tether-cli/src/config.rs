//! Codeletset descriptor files
//!
//! The CLI consumes the YAML/JSON shape:
//!
//! ```yaml
//! codeletset_id: example_set
//! codelet_descriptor:
//!   - codelet_name: reporter
//!     hook_name: test1
//!     codelet_path: ${CODELET_DIR}/reporter.o
//!     priority: 2
//!     out_io_channel:
//!       - name: ring
//!         stream_id: "00112233445566778899aabbccddeeff"
//! ```
//!
//! Paths expand `${VAR}` environment references; channels without a
//! literal `stream_id` get one derived deterministically from the
//! agent address and the channel's addressing path.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tether_lcm::api::{
    validate_string_param, CodeletDesc, CodeletsetLoadReq, CodeletsetUnloadReq, IoChannelDesc,
    LinkedMapDesc, CODELETSET_NAME_LEN, CODELET_NAME_LEN, DEFAULT_PRIORITY, HOOK_NAME_LEN,
    IO_CHANNEL_NAME_LEN, PATH_LEN,
};
use tether_lcm::stream_id::{StreamId, StreamIdError};

/// Failures turning a descriptor file into a request.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read {0}: {1}")]
    Read(String, std::io::Error),

    /// The file is not valid YAML/JSON of the expected shape.
    #[error("could not parse {0}: {1}")]
    Parse(String, String),

    /// A field violates the request bounds.
    #[error("{0}")]
    Invalid(String),

    /// A literal stream id is malformed.
    #[error("invalid stream_id: {0}")]
    StreamId(#[from] StreamIdError),
}

#[derive(Debug, Deserialize)]
struct SerdeFile {
    file_path: String,
}

#[derive(Debug, Deserialize)]
struct ChannelFile {
    name: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    serde: Option<SerdeFile>,
}

#[derive(Debug, Deserialize)]
struct LinkedMapFile {
    map_name: String,
    linked_codelet_name: String,
    linked_map_name: String,
}

#[derive(Debug, Deserialize)]
struct CodeletFile {
    codelet_name: String,
    hook_name: String,
    codelet_path: String,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default)]
    runtime_threshold: Option<u64>,
    #[serde(default)]
    in_io_channel: Vec<ChannelFile>,
    #[serde(default)]
    out_io_channel: Vec<ChannelFile>,
    #[serde(default)]
    linked_maps: Vec<LinkedMapFile>,
}

/// Top-level descriptor file shape.
#[derive(Debug, Deserialize)]
pub struct CodeletsetFile {
    codeletset_id: String,
    codelet_descriptor: Vec<CodeletFile>,
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Expand every `${VAR}` reference in `text`; unset variables expand
/// to the empty string.
pub fn expand_env_vars(text: &str) -> String {
    ENV_VAR
        .replace_all(text, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl CodeletsetFile {
    /// Parse a descriptor file, choosing the format by extension
    /// (`.json` is JSON, everything else YAML).
    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Read(path.to_string(), err))?;
        if path.ends_with(".json") {
            serde_json::from_str(&raw)
                .map_err(|err| ConfigError::Parse(path.to_string(), err.to_string()))
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|err| ConfigError::Parse(path.to_string(), err.to_string()))
        }
    }

    /// The codeletset name.
    pub fn codeletset_id(&self) -> &str {
        &self.codeletset_id
    }

    /// Build the unload request for this descriptor.
    pub fn to_unload_req(&self) -> Result<CodeletsetUnloadReq, ConfigError> {
        validate_string_param("codeletset_id", &self.codeletset_id, CODELETSET_NAME_LEN)
            .map_err(ConfigError::Invalid)?;
        Ok(CodeletsetUnloadReq {
            codeletset_id: self.codeletset_id.clone(),
        })
    }

    /// Build the load request, deriving stream ids where the file
    /// leaves them out. `device` is the agent address used as the
    /// derivation root.
    pub fn to_load_req(&self, device: &str) -> Result<CodeletsetLoadReq, ConfigError> {
        validate_string_param("codeletset_id", &self.codeletset_id, CODELETSET_NAME_LEN)
            .map_err(ConfigError::Invalid)?;

        let mut codelets = Vec::with_capacity(self.codelet_descriptor.len());
        for entry in &self.codelet_descriptor {
            validate_string_param("codelet_name", &entry.codelet_name, CODELET_NAME_LEN)
                .map_err(ConfigError::Invalid)?;
            validate_string_param("hook_name", &entry.hook_name, HOOK_NAME_LEN)
                .map_err(ConfigError::Invalid)?;
            let codelet_path = expand_env_vars(&entry.codelet_path);
            validate_string_param("codelet_path", &codelet_path, PATH_LEN)
                .map_err(ConfigError::Invalid)?;

            let mut desc = CodeletDesc::new(&entry.codelet_name, &entry.hook_name, codelet_path);
            desc.priority = entry.priority.unwrap_or(DEFAULT_PRIORITY);
            desc.runtime_threshold = entry.runtime_threshold.unwrap_or(0);

            for (channels, direction, out) in [
                (&entry.in_io_channel, "input", &mut desc.in_io_channels),
                (&entry.out_io_channel, "output", &mut desc.out_io_channels),
            ] {
                for channel in channels.iter() {
                    out.push(convert_channel(
                        channel,
                        device,
                        &self.codeletset_id,
                        &entry.codelet_name,
                        &entry.hook_name,
                        direction,
                    )?);
                }
            }

            for link in &entry.linked_maps {
                desc.linked_maps.push(LinkedMapDesc {
                    map_name: link.map_name.clone(),
                    linked_codelet_name: link.linked_codelet_name.clone(),
                    linked_map_name: link.linked_map_name.clone(),
                });
            }
            codelets.push(desc);
        }

        Ok(CodeletsetLoadReq {
            codeletset_id: self.codeletset_id.clone(),
            codelets,
        })
    }
}

fn convert_channel(
    channel: &ChannelFile,
    device: &str,
    codeletset_id: &str,
    codelet_name: &str,
    hook_name: &str,
    direction: &str,
) -> Result<IoChannelDesc, ConfigError> {
    validate_string_param("io_channel.name", &channel.name, IO_CHANNEL_NAME_LEN)
        .map_err(ConfigError::Invalid)?;

    let stream_id = match &channel.stream_id {
        Some(hex) => StreamId::from_hex(hex)?,
        None => StreamId::derive(&[
            device,
            codeletset_id,
            codelet_name,
            hook_name,
            direction,
            &channel.name,
        ]),
    };

    let serde_path = match &channel.serde {
        Some(serde) => {
            let path = expand_env_vars(&serde.file_path);
            validate_string_param("io_channel.serde.file_path", &path, PATH_LEN)
                .map_err(ConfigError::Invalid)?;
            Some(path)
        }
        None => None,
    };

    Ok(IoChannelDesc {
        name: channel.name.clone(),
        stream_id,
        serde_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
codeletset_id: example_set
codelet_descriptor:
  - codelet_name: reporter
    hook_name: test1
    codelet_path: /tmp/codelets/reporter.o
    priority: 3
    runtime_threshold: 2000
    out_io_channel:
      - name: ring
        stream_id: "00112233445566778899aabbccddeeff"
  - codelet_name: consumer
    hook_name: test2
    codelet_path: /tmp/codelets/consumer.o
    in_io_channel:
      - name: input
    linked_maps:
      - map_name: shared
        linked_codelet_name: reporter
        linked_map_name: shared
"#;

    #[test]
    fn test_yaml_to_load_req() {
        let file: CodeletsetFile = serde_yaml::from_str(YAML).unwrap();
        let req = file.to_load_req("/tmp/run/sock").unwrap();

        assert_eq!(req.codeletset_id, "example_set");
        assert_eq!(req.codelets.len(), 2);

        let reporter = &req.codelets[0];
        assert_eq!(reporter.priority, 3);
        assert_eq!(reporter.runtime_threshold, 2000);
        assert_eq!(
            reporter.out_io_channels[0].stream_id.to_hex(),
            "00112233445566778899aabbccddeeff"
        );

        let consumer = &req.codelets[1];
        // Defaults apply where the file is silent.
        assert_eq!(consumer.priority, DEFAULT_PRIORITY);
        assert_eq!(consumer.runtime_threshold, 0);
        // The derived stream id is the documented seed-path digest.
        let expected = StreamId::derive(&[
            "/tmp/run/sock",
            "example_set",
            "consumer",
            "test2",
            "input",
            "input",
        ]);
        assert_eq!(consumer.in_io_channels[0].stream_id, expected);
        assert_eq!(consumer.linked_maps[0].linked_codelet_name, "reporter");
    }

    #[test]
    fn test_env_expansion_in_paths() {
        std::env::set_var("TETHER_TEST_DIR", "/opt/codelets");
        assert_eq!(
            expand_env_vars("${TETHER_TEST_DIR}/probe.o"),
            "/opt/codelets/probe.o"
        );
        assert_eq!(expand_env_vars("${TETHER_TEST_UNSET_VAR}/x"), "/x");
        assert_eq!(expand_env_vars("no_vars_here"), "no_vars_here");

        let yaml = r#"
codeletset_id: env_set
codelet_descriptor:
  - codelet_name: probe
    hook_name: test1
    codelet_path: ${TETHER_TEST_DIR}/probe.o
"#;
        let file: CodeletsetFile = serde_yaml::from_str(yaml).unwrap();
        let req = file.to_load_req("addr").unwrap();
        assert_eq!(req.codelets[0].codelet_path, "/opt/codelets/probe.o");
    }

    #[test]
    fn test_invalid_stream_id_is_rejected() {
        let yaml = r#"
codeletset_id: s
codelet_descriptor:
  - codelet_name: c
    hook_name: h
    codelet_path: /tmp/x.o
    out_io_channel:
      - name: ring
        stream_id: "xyz"
"#;
        let file: CodeletsetFile = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            file.to_load_req("addr"),
            Err(ConfigError::StreamId(_))
        ));
    }

    #[test]
    fn test_missing_required_field_fails_parse() {
        let yaml = r#"
codeletset_id: s
codelet_descriptor:
  - hook_name: h
    codelet_path: /tmp/x.o
"#;
        assert!(serde_yaml::from_str::<CodeletsetFile>(yaml).is_err());
    }

    #[test]
    fn test_json_descriptor_parses() {
        let json = r#"{
            "codeletset_id": "json_set",
            "codelet_descriptor": [
                {"codelet_name": "c", "hook_name": "h", "codelet_path": "/tmp/x.o"}
            ]
        }"#;
        let file: CodeletsetFile = serde_json::from_str(json).unwrap();
        let req = file.to_load_req("addr").unwrap();
        assert_eq!(req.codeletset_id, "json_set");
    }

    #[test]
    fn test_from_path_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("set.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        let file = CodeletsetFile::from_path(yaml_path.to_str().unwrap()).unwrap();
        assert_eq!(file.codeletset_id(), "example_set");

        let json_path = dir.path().join("set.json");
        std::fs::write(
            &json_path,
            r#"{"codeletset_id": "j", "codelet_descriptor": []}"#,
        )
        .unwrap();
        let file = CodeletsetFile::from_path(json_path.to_str().unwrap()).unwrap();
        assert_eq!(file.codeletset_id(), "j");

        assert!(matches!(
            CodeletsetFile::from_path("/nonexistent/set.yaml"),
            Err(ConfigError::Read(_, _))
        ));
    }

    #[test]
    fn test_empty_codelet_name_rejected() {
        let yaml = r#"
codeletset_id: s
codelet_descriptor:
  - codelet_name: ""
    hook_name: h
    codelet_path: /tmp/x.o
"#;
        let file: CodeletsetFile = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            file.to_load_req("addr"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
