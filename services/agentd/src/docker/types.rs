//! Docker Engine API wire types: only the fields the agent reads or writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One entry from `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerListItem {
    #[serde(rename = "Id")]
    pub id: String,

    /// Names carry a leading slash on the wire.
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,

    #[serde(rename = "Ports", default)]
    pub ports: Vec<PortEntry>,

    #[serde(rename = "State", default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortEntry {
    #[serde(rename = "PrivatePort")]
    pub private_port: u16,

    #[serde(rename = "PublicPort", default)]
    pub public_port: Option<u16>,

    #[serde(rename = "Type", default)]
    pub proto: String,
}

/// One entry from `GET /images/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageListItem {
    #[serde(rename = "Id")]
    pub id: String,

    /// `null` for dangling images.
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateContainerBody {
    #[serde(rename = "Image")]
    pub image: String,

    #[serde(rename = "Cmd", skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    #[serde(rename = "Env", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Hostname", skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(rename = "ExposedPorts", skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,

    #[serde(rename = "HostConfig")]
    pub host_config: HostConfigBody,

    /// Runtime-opaque spec fields forwarded verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostConfigBody {
    #[serde(rename = "PublishAllPorts")]
    pub publish_all_ports: bool,

    #[serde(rename = "Dns", skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,

    #[serde(rename = "Memory", skip_serializing_if = "is_zero")]
    pub memory: i64,

    #[serde(rename = "CpuShares", skip_serializing_if = "is_zero")]
    pub cpu_shares: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// The slice of `GET /containers/<name>/json` the agent reads.
#[derive(Debug, Clone, Deserialize)]
pub struct InspectResponse {
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    /// `"8080/tcp" -> [{"HostIp":"0.0.0.0","HostPort":"49153"}]`, with
    /// `null` for unpublished ports.
    #[serde(rename = "Ports", default)]
    pub ports: BTreeMap<String, Option<Vec<HostPortEntry>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostPortEntry {
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// Engine error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_list_parses() {
        let body = r#"[{
            "Id": "abc123",
            "Names": ["/0.web.g1.container"],
            "State": "running",
            "Ports": [
                {"PrivatePort": 8080, "PublicPort": 49153, "Type": "tcp"},
                {"PrivatePort": 9000, "Type": "tcp"}
            ]
        }]"#;
        let items: Vec<ContainerListItem> = serde_json::from_str(body).unwrap();
        assert_eq!(items[0].names[0], "/0.web.g1.container");
        assert_eq!(items[0].ports[0].public_port, Some(49153));
        assert_eq!(items[0].ports[1].public_port, None);
    }

    #[test]
    fn test_dangling_image_tags_are_null() {
        let body = r#"[{"Id": "sha256:aa", "RepoTags": null}, {"Id": "sha256:bb", "RepoTags": ["img:1"]}]"#;
        let items: Vec<ImageListItem> = serde_json::from_str(body).unwrap();
        assert!(items[0].repo_tags.is_none());
        assert_eq!(items[1].repo_tags.as_deref().unwrap(), ["img:1"]);
    }

    #[test]
    fn test_create_body_shape() {
        let mut exposed = BTreeMap::new();
        exposed.insert("8080/tcp".to_string(), serde_json::json!({}));
        let body = CreateContainerBody {
            image: "img:1".to_string(),
            hostname: "web0".to_string(),
            exposed_ports: exposed,
            host_config: HostConfigBody {
                publish_all_ports: true,
                dns: vec!["10.0.0.5".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Image"], "img:1");
        assert_eq!(json["HostConfig"]["PublishAllPorts"], true);
        assert_eq!(json["HostConfig"]["Dns"][0], "10.0.0.5");
        // Empty collections and zero limits stay off the wire.
        assert!(json.get("Cmd").is_none());
        assert!(json["HostConfig"].get("Memory").is_none());
    }

    #[test]
    fn test_inspect_ports_parse() {
        let body = r#"{
            "NetworkSettings": {
                "Ports": {
                    "8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "49153"}],
                    "9000/tcp": null
                }
            }
        }"#;
        let inspect: InspectResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            inspect.network_settings.ports["8080/tcp"].as_deref().unwrap()[0].host_port,
            "49153"
        );
        assert!(inspect.network_settings.ports["9000/tcp"].is_none());
    }
}
