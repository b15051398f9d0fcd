//! Polymorphic entity identifiers
//!
//! Events and subscriptions refer to network entities through
//! [`EntityIdentifiers`], a tagged sum whose wire form names the variant by
//! its outer field:
//!
//! ```json
//! {"application_ids": {"application_id": "foo"}}
//! {"device_ids": {"device_id": "dev1", "application_ids": {"application_id": "foo"}}}
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[-]?[a-z0-9]){2,}$").expect("identifier pattern is valid")
});

static EUI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{16}$").expect("EUI pattern is valid"));

static DEV_ADDR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{8}$").expect("DevAddr pattern is valid"));

const MAX_ID_LENGTH: usize = 36;

/// Application identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationIdentifiers {
    pub application_id: String,
}

/// OAuth client identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientIdentifiers {
    pub client_id: String,
}

/// Gateway identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GatewayIdentifiers {
    pub gateway_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eui: Option<String>,
}

/// User identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserIdentifiers {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Organization identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrganizationIdentifiers {
    pub organization_id: String,
}

/// End device identifiers, scoped to an application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndDeviceIdentifiers {
    pub device_id: String,
    pub application_ids: ApplicationIdentifiers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_eui: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_eui: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_addr: Option<String>,
}

/// Reference to a single network entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityIdentifiers {
    ApplicationIds(ApplicationIdentifiers),
    ClientIds(ClientIdentifiers),
    GatewayIds(GatewayIdentifiers),
    UserIds(UserIdentifiers),
    OrganizationIds(OrganizationIdentifiers),
    DeviceIds(EndDeviceIdentifiers),
}

/// Kind of entity referenced by [`EntityIdentifiers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Application,
    Client,
    Gateway,
    User,
    Organization,
    EndDevice,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Application => "application",
            Self::Client => "client",
            Self::Gateway => "gateway",
            Self::User => "user",
            Self::Organization => "organization",
            Self::EndDevice => "end device",
        };
        f.write_str(name)
    }
}

impl EntityIdentifiers {
    /// Application identifiers
    pub fn application(application_id: impl Into<String>) -> Self {
        Self::ApplicationIds(ApplicationIdentifiers {
            application_id: application_id.into(),
        })
    }

    /// OAuth client identifiers
    pub fn client(client_id: impl Into<String>) -> Self {
        Self::ClientIds(ClientIdentifiers {
            client_id: client_id.into(),
        })
    }

    /// Gateway identifiers
    pub fn gateway(gateway_id: impl Into<String>) -> Self {
        Self::GatewayIds(GatewayIdentifiers {
            gateway_id: gateway_id.into(),
            eui: None,
        })
    }

    /// User identifiers
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::UserIds(UserIdentifiers {
            user_id: user_id.into(),
            email: None,
        })
    }

    /// Organization identifiers
    pub fn organization(organization_id: impl Into<String>) -> Self {
        Self::OrganizationIds(OrganizationIdentifiers {
            organization_id: organization_id.into(),
        })
    }

    /// End device identifiers
    pub fn device(application_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::DeviceIds(EndDeviceIdentifiers {
            device_id: device_id.into(),
            application_ids: ApplicationIdentifiers {
                application_id: application_id.into(),
            },
            dev_eui: None,
            join_eui: None,
            dev_addr: None,
        })
    }

    /// Kind of the referenced entity
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::ApplicationIds(_) => EntityKind::Application,
            Self::ClientIds(_) => EntityKind::Client,
            Self::GatewayIds(_) => EntityKind::Gateway,
            Self::UserIds(_) => EntityKind::User,
            Self::OrganizationIds(_) => EntityKind::Organization,
            Self::DeviceIds(_) => EntityKind::EndDevice,
        }
    }

    /// Primary ID of the entity, without EUIs or addresses
    ///
    /// End devices are keyed as `<application_id>.<device_id>`.
    pub fn id_string(&self) -> String {
        match self {
            Self::ApplicationIds(ids) => ids.application_id.clone(),
            Self::ClientIds(ids) => ids.client_id.clone(),
            Self::GatewayIds(ids) => ids.gateway_id.clone(),
            Self::UserIds(ids) => ids.user_id.clone(),
            Self::OrganizationIds(ids) => ids.organization_id.clone(),
            Self::DeviceIds(ids) => {
                format!("{}.{}", ids.application_ids.application_id, ids.device_id)
            }
        }
    }

    /// Whether both identifiers refer to the same entity, ignoring EUIs and addresses
    pub fn same_entity(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.id_string() == other.id_string()
    }

    /// Entity whose rights govern access to this one
    ///
    /// Rights on an end device are the rights on its application.
    pub fn rights_entity(&self) -> EntityIdentifiers {
        match self {
            Self::DeviceIds(ids) => Self::ApplicationIds(ids.application_ids.clone()),
            other => other.clone(),
        }
    }

    /// Whether a subscription on `self` receives events about `other`
    ///
    /// An application subscription also covers the application's end devices.
    pub fn covers(&self, other: &Self) -> bool {
        if self.same_entity(other) {
            return true;
        }
        match (self, other) {
            (Self::ApplicationIds(app), Self::DeviceIds(dev)) => {
                app.application_id == dev.application_ids.application_id
            }
            _ => false,
        }
    }

    /// Validate the identifier fields
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ApplicationIds(ids) => validate_id("application_id", &ids.application_id),
            Self::ClientIds(ids) => validate_id("client_id", &ids.client_id),
            Self::GatewayIds(ids) => {
                validate_id("gateway_id", &ids.gateway_id)?;
                validate_hex("eui", ids.eui.as_deref(), &EUI_REGEX)
            }
            Self::UserIds(ids) => validate_id("user_id", &ids.user_id),
            Self::OrganizationIds(ids) => validate_id("organization_id", &ids.organization_id),
            Self::DeviceIds(ids) => {
                validate_id("device_id", &ids.device_id)?;
                validate_id("application_id", &ids.application_ids.application_id)?;
                validate_hex("dev_eui", ids.dev_eui.as_deref(), &EUI_REGEX)?;
                validate_hex("join_eui", ids.join_eui.as_deref(), &EUI_REGEX)?;
                validate_hex("dev_addr", ids.dev_addr.as_deref(), &DEV_ADDR_REGEX)
            }
        }
    }
}

impl fmt::Display for EntityIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}`", self.kind(), self.id_string())
    }
}

fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_ID_LENGTH || !ID_REGEX.is_match(value) {
        return Err(Error::invalid_argument(
            "identifiers",
            format!("invalid `{field}`: `{value}`"),
        ));
    }
    Ok(())
}

fn validate_hex(field: &str, value: Option<&str>, pattern: &Regex) -> Result<()> {
    match value {
        Some(value) if !pattern.is_match(value) => Err(Error::invalid_argument(
            "identifiers",
            format!("invalid `{field}`: `{value}`"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_form_tags_variant_by_field_name() {
        let ids = EntityIdentifiers::application("foo");
        assert_eq!(
            serde_json::to_value(&ids).unwrap(),
            json!({"application_ids": {"application_id": "foo"}})
        );

        let ids: EntityIdentifiers = serde_json::from_value(json!({
            "device_ids": {
                "device_id": "dev1",
                "application_ids": {"application_id": "foo"},
                "dev_eui": "0011223344556677"
            }
        }))
        .unwrap();
        assert_eq!(ids.kind(), EntityKind::EndDevice);
        assert_eq!(ids.id_string(), "foo.dev1");
        assert!(ids.validate().is_ok());
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let result: std::result::Result<EntityIdentifiers, _> =
            serde_json::from_value(json!({"network_ids": {"net_id": "000013"}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_ids() {
        assert!(EntityIdentifiers::application("foo").validate().is_ok());
        assert!(EntityIdentifiers::gateway("my-gateway-1").validate().is_ok());
        assert!(EntityIdentifiers::application("Foo").validate().is_err());
        assert!(EntityIdentifiers::application("fo").validate().is_err());
        assert!(EntityIdentifiers::application("foo--bar").validate().is_err());
        assert!(EntityIdentifiers::application("-foo").validate().is_err());
        assert!(EntityIdentifiers::application("a".repeat(37)).validate().is_err());

        let err = EntityIdentifiers::user("").validate().unwrap_err();
        assert_eq!(err.name(), "identifiers");
    }

    #[test]
    fn test_validate_rejects_malformed_euis() {
        let ids = EntityIdentifiers::GatewayIds(GatewayIdentifiers {
            gateway_id: "gtw".to_string(),
            eui: Some("not-an-eui".to_string()),
        });
        assert!(ids.validate().is_err());
    }

    #[test]
    fn test_application_covers_its_devices() {
        let app = EntityIdentifiers::application("foo");
        assert!(app.covers(&EntityIdentifiers::device("foo", "dev1")));
        assert!(!app.covers(&EntityIdentifiers::device("bar", "dev1")));
        assert!(!app.covers(&EntityIdentifiers::gateway("foo")));
        assert!(!EntityIdentifiers::device("foo", "dev1").covers(&app));
    }

    #[test]
    fn test_same_entity_ignores_euis() {
        let with_eui = EntityIdentifiers::GatewayIds(GatewayIdentifiers {
            gateway_id: "gtw".to_string(),
            eui: Some("0011223344556677".to_string()),
        });
        assert!(with_eui.same_entity(&EntityIdentifiers::gateway("gtw")));
    }

    #[test]
    fn test_device_rights_entity_is_application() {
        assert_eq!(
            EntityIdentifiers::device("foo", "dev1").rights_entity(),
            EntityIdentifiers::application("foo")
        );
    }
}
