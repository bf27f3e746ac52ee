//! Application units and the resources they declare.
//!
//! An application unit is one independently deployable bundle targeted at a
//! single account/region pair. Resource contents are opaque to the core; only
//! identity and permission grants are inspected.

use serde::{Deserialize, Serialize};

/// Target account and region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Who a grant gives access to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Principal {
    /// Anyone (`*`).
    Any,
    /// Every identity in an account.
    Account(String),
    /// A cloud service principal, e.g. `lambda.amazonaws.com`.
    Service(String),
    /// A specific role or user.
    Arn(String),
}

impl Principal {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Principal::Any)
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Any => write!(f, "*"),
            Principal::Account(id) => write!(f, "account:{}", id),
            Principal::Service(name) => write!(f, "service:{}", name),
            Principal::Arn(arn) => write!(f, "{}", arn),
        }
    }
}

impl std::str::FromStr for Principal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Principal::Any);
        }
        if let Some(id) = s.strip_prefix("account:") {
            return non_empty(id, s).map(|id| Principal::Account(id.to_string()));
        }
        if let Some(name) = s.strip_prefix("service:") {
            return non_empty(name, s).map(|name| Principal::Service(name.to_string()));
        }
        if s.starts_with("arn:") {
            return Ok(Principal::Arn(s.to_string()));
        }
        if s.len() == 12 && s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Principal::Account(s.to_string()));
        }
        Err(format!("Unknown principal: {}", s))
    }
}

fn non_empty<'a>(value: &'a str, whole: &str) -> Result<&'a str, String> {
    if value.is_empty() {
        Err(format!("Incomplete principal: {}", whole))
    } else {
        Ok(value)
    }
}

impl TryFrom<String> for Principal {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Principal> for String {
    fn from(principal: Principal) -> Self {
        principal.to_string()
    }
}

/// A permission grant on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub principal: Principal,
    pub actions: Vec<String>,
}

impl Grant {
    pub fn new<I, S>(principal: Principal, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal,
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// True if any action is `*` or a whole-service wildcard like `s3:*`.
    pub fn has_wildcard_action(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a == "*" || a.ends_with(":*"))
    }
}

/// What happens to a resource when its unit is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Retain,
    Destroy,
}

impl std::str::FromStr for RemovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retain" => Ok(RemovalPolicy::Retain),
            "destroy" => Ok(RemovalPolicy::Destroy),
            _ => Err(format!("Unknown removal policy: {}", s)),
        }
    }
}

/// A declared resource. `id` is its identity inside the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub removal: RemovalPolicy,
    #[serde(default)]
    pub auto_delete_objects: bool,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            removal: RemovalPolicy::default(),
            auto_delete_objects: false,
            grants: Vec::new(),
        }
    }

    pub fn with_removal(mut self, removal: RemovalPolicy) -> Self {
        self.removal = removal;
        self
    }

    pub fn with_auto_delete_objects(mut self) -> Self {
        self.auto_delete_objects = true;
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }
}

/// The closed set of unit kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UnitKind {
    /// A bundle of declared resources.
    Stack,
    /// A validation action, run once every stack in its stage is deployed.
    Script { commands: Vec<String> },
}

/// One independently deployable bundle of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationUnit {
    pub name: String,
    pub kind: UnitKind,
    pub env: Environment,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl ApplicationUnit {
    pub fn stack(name: impl Into<String>, env: Environment) -> Self {
        Self {
            name: name.into(),
            kind: UnitKind::Stack,
            env,
            resources: Vec::new(),
        }
    }

    pub fn script<I, S>(name: impl Into<String>, env: Environment, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: UnitKind::Script {
                commands: commands.into_iter().map(Into::into).collect(),
            },
            env,
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn is_script(&self) -> bool {
        matches!(self.kind, UnitKind::Script { .. })
    }

    /// Every grant declared by this unit, paired with its resource id.
    pub fn grants(&self) -> impl Iterator<Item = (&str, &Grant)> {
        self.resources
            .iter()
            .flat_map(|r| r.grants.iter().map(move |g| (r.id.as_str(), g)))
    }
}
