// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! CTFd credential data and topology templating

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const DATA_FILE: &str = "ctfd_data.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub variable: String,
    pub contents: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtfdUser {
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<Flag>>,
}

impl CtfdUser {
    fn has_team(&self) -> bool {
        self.team.as_deref().is_some_and(|t| !t.is_empty())
    }

    fn has_flags(&self) -> bool {
        self.flags.as_ref().is_some_and(|f| !f.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtfdData {
    pub ctfd_data: Vec<CtfdUser>,
}

impl CtfdData {
    /// Users must be named and unique; teams and flags are all-or-none
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for user in &self.ctfd_data {
            if user.user.trim().is_empty() {
                return Err("user name must not be empty".to_string());
            }
            if !seen.insert(user.user.as_str()) {
                return Err(format!("duplicate user found: {}", user.user));
            }
        }
        if !uniform(self.ctfd_data.iter().map(CtfdUser::has_team)) {
            return Err("missing or empty 'team' field".to_string());
        }
        if !uniform(self.ctfd_data.iter().map(CtfdUser::has_flags)) {
            return Err("inconsistent flags: if one user has flags, all users must have flags".to_string());
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> std::io::Result<Option<Self>> {
        let path = dir.join(DATA_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(DATA_FILE), text)
    }
}

/// True when every item agrees with the first
pub fn uniform(mut values: impl Iterator<Item = bool>) -> bool {
    match values.next() {
        Some(first) => values.all(|v| v == first),
        None => true,
    }
}

fn default_visibility_private() -> String { "private".to_string() }
fn default_visibility_public() -> String { "public".to_string() }
fn default_true() -> String { "true".to_string() }
fn default_false() -> String { "false".to_string() }
fn default_time_zone() -> String { "UTC".to_string() }

/// Settings substituted into the CTFd topology template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequest {
    pub topology_name: String,
    pub scenario_id: String,
    pub pool_id: String,
    #[serde(default)]
    pub username_config: String,
    #[serde(default)]
    pub password_config: String,
    pub admin_username: String,
    pub admin_password: String,
    pub ctf_name: String,
    #[serde(default)]
    pub ctf_description: String,
    #[serde(default = "default_visibility_private")]
    pub challenge_visibility: String,
    #[serde(default = "default_visibility_public")]
    pub account_visibility: String,
    #[serde(default = "default_visibility_public")]
    pub score_visibility: String,
    #[serde(default = "default_visibility_private")]
    pub registration_visibility: String,
    #[serde(default = "default_true")]
    pub allow_name_changes: String,
    #[serde(default = "default_true")]
    pub allow_team_creation: String,
    #[serde(default = "default_false")]
    pub allow_team_disbanding: String,
    #[serde(default)]
    pub conf_start_time: String,
    #[serde(default)]
    pub conf_stop_time: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_false")]
    pub allow_viewing_after: String,
}

impl TopologyRequest {
    /// Name of the generated topology file
    pub fn file_name(&self) -> Result<String, String> {
        let valid = !self.topology_name.is_empty()
            && self
                .topology_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err("topologyName may only contain letters, digits, '_' and '-'".to_string());
        }
        Ok(format!("ctfd_{}.yml", self.topology_name))
    }

    fn replacements(&self) -> [(&'static str, &str); 19] {
        [
            ("$SECENARIO_ID", self.scenario_id.as_str()),
            ("$POOL_ID", self.pool_id.as_str()),
            ("$USERNAME_CONFIG", self.username_config.as_str()),
            ("$PASSWORD_CONFIG", self.password_config.as_str()),
            ("$ADMIN_USERNAME", self.admin_username.as_str()),
            ("$ADMIN_PASSWORD", self.admin_password.as_str()),
            ("$CTF_NAME", self.ctf_name.as_str()),
            ("$CTF_DESCRIPTION", self.ctf_description.as_str()),
            ("$CHALLENGE_VISIBILITY", self.challenge_visibility.as_str()),
            ("$ACCOUNT_VISIBILITY", self.account_visibility.as_str()),
            ("$SCORE_VISIBILITY", self.score_visibility.as_str()),
            ("$REGISTRATION_VISIBILITY", self.registration_visibility.as_str()),
            ("$ALLOW_NAME_CHANGES", self.allow_name_changes.as_str()),
            ("$ALLOW_TEAM_CREATION", self.allow_team_creation.as_str()),
            ("$ALLOW_TEAM_DISBANDING", self.allow_team_disbanding.as_str()),
            ("$CONF_START_TIME", self.conf_start_time.as_str()),
            ("$CONF_STOP_TIME", self.conf_stop_time.as_str()),
            ("$TIME_ZONE", self.time_zone.as_str()),
            ("$ALLOW_VIEWING_AFTER", self.allow_viewing_after.as_str()),
        ]
    }

    /// Substitute every placeholder with its quoted value
    pub fn render(&self, template: &str) -> String {
        let mut pairs = self.replacements();
        // longest first so no placeholder eats the head of another
        pairs.sort_by_key(|(placeholder, _)| std::cmp::Reverse(placeholder.len()));
        pairs.iter().fold(template.to_string(), |content, (placeholder, value)| {
            content.replace(placeholder, &quote(value))
        })
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
