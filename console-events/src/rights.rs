//! Rights, principals and the rights resolver seam
//!
//! The gateway never authenticates callers itself. It hands the caller's
//! [`Credentials`] to a [`RightsResolver`], the embedding's identity service,
//! and asks it who the caller is and which rights it holds on an entity.
//! [`Caller`] bundles both and is threaded through every connection task the
//! way a request context would be.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{Definitions, Event};
use crate::identifiers::{EntityIdentifiers, EntityKind, UserIdentifiers};

/// A single capability a principal can hold on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Right {
    RightUserInfo,
    RightUserSettingsBasic,
    RightUserAll,
    RightApplicationInfo,
    RightApplicationSettingsBasic,
    RightApplicationDevicesRead,
    RightApplicationDevicesWrite,
    RightApplicationTrafficRead,
    RightApplicationTrafficDownWrite,
    RightApplicationAll,
    RightClientAll,
    RightGatewayInfo,
    RightGatewaySettingsBasic,
    RightGatewayStatusRead,
    RightGatewayLocationRead,
    RightGatewayTrafficRead,
    RightGatewayAll,
    RightOrganizationInfo,
    RightOrganizationSettingsBasic,
    RightOrganizationAll,
    RightAll,
}

const ALL_RIGHTS: &[Right] = &[
    Right::RightUserInfo,
    Right::RightUserSettingsBasic,
    Right::RightUserAll,
    Right::RightApplicationInfo,
    Right::RightApplicationSettingsBasic,
    Right::RightApplicationDevicesRead,
    Right::RightApplicationDevicesWrite,
    Right::RightApplicationTrafficRead,
    Right::RightApplicationTrafficDownWrite,
    Right::RightApplicationAll,
    Right::RightClientAll,
    Right::RightGatewayInfo,
    Right::RightGatewaySettingsBasic,
    Right::RightGatewayStatusRead,
    Right::RightGatewayLocationRead,
    Right::RightGatewayTrafficRead,
    Right::RightGatewayAll,
    Right::RightOrganizationInfo,
    Right::RightOrganizationSettingsBasic,
    Right::RightOrganizationAll,
    Right::RightAll,
];

impl Right {
    /// Entity kind this right applies to (`None` for `RIGHT_ALL`)
    pub fn entity_kind(self) -> Option<EntityKind> {
        use Right::*;
        match self {
            RightUserInfo | RightUserSettingsBasic | RightUserAll => Some(EntityKind::User),
            RightApplicationInfo
            | RightApplicationSettingsBasic
            | RightApplicationDevicesRead
            | RightApplicationDevicesWrite
            | RightApplicationTrafficRead
            | RightApplicationTrafficDownWrite
            | RightApplicationAll => Some(EntityKind::Application),
            RightClientAll => Some(EntityKind::Client),
            RightGatewayInfo
            | RightGatewaySettingsBasic
            | RightGatewayStatusRead
            | RightGatewayLocationRead
            | RightGatewayTrafficRead
            | RightGatewayAll => Some(EntityKind::Gateway),
            RightOrganizationInfo | RightOrganizationSettingsBasic | RightOrganizationAll => {
                Some(EntityKind::Organization)
            }
            RightAll => None,
        }
    }

    fn is_all(self) -> bool {
        matches!(
            self,
            Right::RightUserAll
                | Right::RightApplicationAll
                | Right::RightClientAll
                | Right::RightGatewayAll
                | Right::RightOrganizationAll
                | Right::RightAll
        )
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// An ordered set of rights
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    #[serde(default)]
    pub rights: BTreeSet<Right>,
}

impl Rights {
    /// Create a set from a list of rights
    pub fn new(rights: impl IntoIterator<Item = Right>) -> Self {
        Self {
            rights: rights.into_iter().collect(),
        }
    }

    /// Whether the set holds no rights
    pub fn is_empty(&self) -> bool {
        self.rights.is_empty()
    }

    /// Whether the set contains `right`
    pub fn contains(&self, right: Right) -> bool {
        self.rights.contains(&right)
    }

    /// Iterate over the rights
    pub fn iter(&self) -> impl Iterator<Item = Right> + '_ {
        self.rights.iter().copied()
    }

    /// Expand `RIGHT_ALL` and `RIGHT_<ENTITY>_ALL` into the rights they imply
    pub fn implied(&self) -> Rights {
        let mut implied = self.rights.clone();
        for right in self.rights.iter().copied().filter(|r| r.is_all()) {
            match right.entity_kind() {
                None => implied.extend(ALL_RIGHTS.iter().copied()),
                Some(kind) => implied.extend(
                    ALL_RIGHTS
                        .iter()
                        .copied()
                        .filter(|r| r.entity_kind() == Some(kind)),
                ),
            }
        }
        Rights { rights: implied }
    }

    /// Rights present in both sets
    pub fn intersect(&self, other: &Rights) -> Rights {
        Rights {
            rights: self.rights.intersection(&other.rights).copied().collect(),
        }
    }

    /// Rights present in either set
    pub fn union(&self, other: &Rights) -> Rights {
        Rights {
            rights: self.rights.union(&other.rights).copied().collect(),
        }
    }
}

impl FromIterator<Right> for Rights {
    fn from_iter<T: IntoIterator<Item = Right>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Bearer credentials presented by a caller
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap a bearer token
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw bearer token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Short, non-reversible fingerprint suitable for logs and rate limit keys
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.token.as_bytes());
        hash.to_hex()[..16].to_string()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(bearer:{})", self.fingerprint())
    }
}

/// The identified caller behind a set of credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// An API key
    ApiKey {
        id: String,
        entity_ids: EntityIdentifiers,
    },
    /// An OAuth access token
    AccessToken {
        id: String,
        user_ids: UserIdentifiers,
    },
    /// A console user session
    UserSession {
        session_id: String,
        user_ids: UserIdentifiers,
    },
    /// A gateway token
    GatewayToken {
        gateway_ids: EntityIdentifiers,
    },
}

/// Authentication information resolved for a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// The identified principal
    pub principal: Principal,

    /// Rights the principal holds on every entity (e.g. administrators)
    pub universal_rights: Rights,
}

impl AuthInfo {
    /// Authentication info without universal rights
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            universal_rights: Rights::default(),
        }
    }
}

/// Identity and rights service the gateway depends on
#[async_trait]
pub trait RightsResolver: Send + Sync {
    /// Identify the principal behind the credentials
    ///
    /// Fails with `Unauthenticated` when the credentials are unknown, expired
    /// or revoked.
    async fn auth_info(&self, credentials: &Credentials) -> Result<AuthInfo>;

    /// Rights the credentials hold on an entity (empty when none)
    async fn entity_rights(
        &self,
        credentials: &Credentials,
        ids: &EntityIdentifiers,
    ) -> Result<Rights>;
}

/// An authenticated caller: credentials plus the resolver that interprets them
#[derive(Clone)]
pub struct Caller {
    credentials: Credentials,
    resolver: Arc<dyn RightsResolver>,
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Caller {
    /// Create a caller
    pub fn new(credentials: Credentials, resolver: Arc<dyn RightsResolver>) -> Self {
        Self {
            credentials,
            resolver,
        }
    }

    /// The caller's credentials
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Resolve the caller's authentication info
    pub async fn auth_info(&self) -> Result<AuthInfo> {
        self.resolver.auth_info(&self.credentials).await
    }

    /// Require the caller to still be authenticated
    ///
    /// Lapsed authentication surfaces as `PermissionDenied`.
    pub async fn require_authenticated(&self) -> Result<AuthInfo> {
        self.auth_info().await.map_err(|err| match err {
            Error::Unauthenticated { message, .. } => {
                Error::permission_denied("unauthenticated", message)
            }
            other => other,
        })
    }

    /// Require at least one right on every given entity
    pub async fn require_any(&self, ids: &[EntityIdentifiers]) -> Result<()> {
        for entity in ids {
            let rights = self
                .resolver
                .entity_rights(&self.credentials, &entity.rights_entity())
                .await?;
            if rights.is_empty() {
                return Err(Error::permission_denied(
                    "no_rights",
                    format!("no rights for {entity}"),
                ));
            }
        }
        Ok(())
    }

    /// Whether the caller may see the event
    ///
    /// The rights an event requires come from its registered definition,
    /// never from the event itself. The event is visible when, on any of its
    /// identifiers, the caller's implied rights intersect them. An event
    /// whose name is not defined only requires some right on one of its
    /// identifiers.
    pub async fn event_is_visible(
        &self,
        event: &Event,
        definitions: &Definitions,
    ) -> Result<bool> {
        let required = definitions
            .lookup(&event.name)
            .map(|definition| definition.visibility().clone())
            .unwrap_or_default();
        let required = &required;
        for entity in &event.identifiers {
            let rights = self
                .resolver
                .entity_rights(&self.credentials, &entity.rights_entity())
                .await?
                .implied();
            if rights.is_empty() {
                continue;
            }
            if required.is_empty() || !rights.intersect(required).is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Clone)]
struct Grant {
    auth_info: AuthInfo,
    rights: HashMap<(EntityKind, String), Rights>,
}

/// In-memory rights resolver keyed by bearer token
///
/// Suitable for embedding in development setups and for tests. Tokens are
/// registered with a principal, granted rights per entity, and can be revoked
/// at any time; revocation takes effect on the next resolution.
#[derive(Debug, Default)]
pub struct MemoryRightsResolver {
    grants: DashMap<String, Grant>,
}

impl MemoryRightsResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a principal
    pub fn register(&self, token: impl Into<String>, principal: Principal) {
        self.grants.insert(
            token.into(),
            Grant {
                auth_info: AuthInfo::new(principal),
                rights: HashMap::new(),
            },
        );
    }

    /// Grant rights on an entity to a registered token
    pub fn grant(&self, token: &str, ids: &EntityIdentifiers, rights: Rights) {
        if let Some(mut grant) = self.grants.get_mut(token) {
            let key = (ids.kind(), ids.id_string());
            let merged = grant
                .rights
                .get(&key)
                .map(|existing| existing.union(&rights))
                .unwrap_or(rights);
            grant.rights.insert(key, merged);
        }
    }

    /// Grant rights on every entity to a registered token
    pub fn grant_universal(&self, token: &str, rights: Rights) {
        if let Some(mut grant) = self.grants.get_mut(token) {
            grant.auth_info.universal_rights = grant.auth_info.universal_rights.union(&rights);
        }
    }

    /// Revoke a token
    pub fn revoke(&self, token: &str) {
        self.grants.remove(token);
    }
}

#[async_trait]
impl RightsResolver for MemoryRightsResolver {
    async fn auth_info(&self, credentials: &Credentials) -> Result<AuthInfo> {
        self.grants
            .get(credentials.token())
            .map(|grant| grant.auth_info.clone())
            .ok_or_else(|| Error::unauthenticated("unknown_token", "token not found or revoked"))
    }

    async fn entity_rights(
        &self,
        credentials: &Credentials,
        ids: &EntityIdentifiers,
    ) -> Result<Rights> {
        let grant = self
            .grants
            .get(credentials.token())
            .ok_or_else(|| Error::unauthenticated("unknown_token", "token not found or revoked"))?;
        let entity_rights = grant
            .rights
            .get(&(ids.kind(), ids.id_string()))
            .cloned()
            .unwrap_or_default();
        Ok(entity_rights.union(&grant.auth_info.universal_rights))
    }
}
