// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! User pools: a topology plus the Ludus users who get a range from it
//!
//! A pool is stored as `<pools>/<poolId>/pool.json`. Generated CTFd
//! credentials for the pool sit next to it in `ctfd_data.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

use crate::ctfd::{self, CtfdData};
use crate::store::{timestamp, FolderError, FolderStore};

const POOL_FILE: &str = "pool.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolType {
    Individual,
    Shared,
    Ctfd,
}

impl PoolType {
    /// Shared and CTFd pools are driven through one main user range
    pub fn has_main_user(self) -> bool {
        matches!(self, PoolType::Shared | PoolType::Ctfd)
    }
}

/// Which identities of a pool an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserIdMode {
    #[default]
    MainUserOnly,
    MembersOnly,
    AllUsers,
}

impl FromStr for UserIdMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(UserIdMode::MainUserOnly),
            "members" => Ok(UserIdMode::MembersOnly),
            "all" => Ok(UserIdMode::AllUsers),
            other => Err(PoolError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMember {
    pub user: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl PoolMember {
    /// Ludus user id for a display name: `BATCH` + lowercase name without spaces
    pub fn derive_user_id(user: &str) -> String {
        format!("BATCH{}", user.replace(' ', "").to_lowercase())
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub note: String,
    pub topology_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctfd_data_id: Option<String>,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_user: Option<String>,
    #[serde(default)]
    pub users_and_teams: Vec<PoolMember>,
}

impl Pool {
    pub fn main_user(&self) -> Option<&str> {
        self.main_user.as_deref().filter(|u| !u.is_empty())
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.users_and_teams.iter().map(|m| m.user_id.clone()).collect()
    }

    /// Concrete Ludus user ids for `mode`. Individual pools ignore the mode.
    pub fn user_ids(&self, mode: UserIdMode) -> Vec<String> {
        if !self.pool_type.has_main_user() {
            return self.member_ids();
        }
        let mut ids = Vec::with_capacity(self.users_and_teams.len() + 1);
        if matches!(mode, UserIdMode::MainUserOnly | UserIdMode::AllUsers) {
            if let Some(main) = self.main_user() {
                ids.push(main.to_string());
            }
        }
        if matches!(mode, UserIdMode::MembersOnly | UserIdMode::AllUsers) {
            ids.extend(self.member_ids());
        }
        ids
    }

    /// Fill in every member's user id from its display name
    pub fn assign_user_ids(&mut self) {
        for member in &mut self.users_and_teams {
            member.user_id = PoolMember::derive_user_id(&member.user);
        }
    }

    /// Structural rules that need no other pool to check
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.topology_id.is_empty() {
            return Err(PoolError::Invalid("topologyId is required".to_string()));
        }
        match (self.pool_type.has_main_user(), self.main_user()) {
            (true, None) => {
                return Err(PoolError::Invalid("mainUser is required for SHARED and CTFD pools".to_string()));
            }
            (false, Some(_)) => {
                return Err(PoolError::Invalid("INDIVIDUAL pools have no mainUser".to_string()));
            }
            _ => {}
        }
        validate_members(&self.users_and_teams)?;
        if let Some(main) = self.main_user() {
            if self.users_and_teams.iter().any(|m| m.user == main || m.user_id == main) {
                return Err(PoolError::Invalid(format!(
                    "main user '{}' cannot be included in usersAndTeams",
                    main
                )));
            }
        }
        Ok(())
    }
}

/// Names and derived ids unique; teams set on all members or none
pub fn validate_members(members: &[PoolMember]) -> Result<(), PoolError> {
    let mut users = HashSet::new();
    let mut ids = HashSet::new();
    for member in members {
        if member.user.trim().is_empty() {
            return Err(PoolError::Invalid("user must not be empty".to_string()));
        }
        if !users.insert(member.user.as_str()) || !ids.insert(member.user_id.as_str()) {
            return Err(PoolError::Invalid(format!("duplicate user found: {}", member.user)));
        }
    }
    if !ctfd::uniform(members.iter().map(|m| m.team().is_some())) {
        return Err(PoolError::Invalid("missing or empty 'team' field".to_string()));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid pool id")]
    InvalidId,

    #[error("pool not found")]
    NotFound,

    #[error("invalid user scope '{0}', expected main, members or all")]
    InvalidMode(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<FolderError> for PoolError {
    fn from(err: FolderError) -> Self {
        match err {
            FolderError::InvalidId => PoolError::InvalidId,
            FolderError::NotFound => PoolError::NotFound,
            FolderError::Io(e) => PoolError::Io(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStore {
    folders: FolderStore,
}

impl PoolStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { folders: FolderStore::new(base) }
    }

    pub fn folders(&self) -> &FolderStore {
        &self.folders
    }

    fn read_at(dir: &Path) -> Result<Pool, PoolError> {
        let text = match fs::read_to_string(dir.join(POOL_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(PoolError::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    fn write_at(dir: &Path, pool: &Pool) -> Result<(), PoolError> {
        fs::write(dir.join(POOL_FILE), serde_json::to_string_pretty(pool)?)?;
        Ok(())
    }

    pub fn get(&self, pool_id: &str) -> Result<Pool, PoolError> {
        let dir = self.folders.validate(pool_id)?;
        Self::read_at(&dir)
    }

    /// Resolve a pool to the user ids a batch should target. One read, no writes.
    pub fn resolve_user_ids(&self, pool_id: &str, mode: UserIdMode) -> Result<Vec<String>, PoolError> {
        Ok(self.get(pool_id)?.user_ids(mode))
    }

    /// Every readable pool except `skip`
    fn others(&self, skip: Option<&str>) -> Result<Vec<(String, Pool)>, PoolError> {
        let mut pools = Vec::new();
        for item in self.folders.list()? {
            if Some(item.id.as_str()) == skip {
                continue;
            }
            match self.get(&item.id) {
                Ok(pool) => pools.push((item.id, pool)),
                Err(e) => warn!("Skipping unreadable pool {}: {}", item.id, e),
            }
        }
        Ok(pools)
    }

    /// Cross-pool rules: a main user belongs to one pool only and is never another pool's member
    pub fn check_cross_pool(&self, pool: &Pool, skip: Option<&str>) -> Result<(), PoolError> {
        let others = self.others(skip)?;
        if let Some(main) = pool.main_user() {
            for (id, other) in &others {
                if other.main_user() == Some(main) || other.users_and_teams.iter().any(|m| m.user_id == main) {
                    return Err(PoolError::Conflict(format!(
                        "main user '{}' is already used by pool {}",
                        main, id
                    )));
                }
            }
        }
        let main_users: HashSet<&str> = others.iter().filter_map(|(_, p)| p.main_user()).collect();
        if let Some(member) = pool.users_and_teams.iter().find(|m| main_users.contains(m.user_id.as_str())) {
            return Err(PoolError::Conflict(format!(
                "user ID '{}' is already being used as a main user in another pool",
                member.user_id
            )));
        }
        Ok(())
    }

    /// Validate and persist a new pool; returns its id
    pub fn create(&self, mut pool: Pool) -> Result<String, PoolError> {
        pool.assign_user_ids();
        pool.validate()?;
        self.check_cross_pool(&pool, None)?;
        let (id, dir) = self.folders.create()?;
        if let Err(e) = Self::write_at(&dir, &pool) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        info!("Created pool {} ({:?}, {} members)", id, pool.pool_type, pool.users_and_teams.len());
        Ok(id)
    }

    /// Read-modify-write of one pool; the result is re-validated before saving
    pub fn update<F>(&self, pool_id: &str, change: F) -> Result<Pool, PoolError>
    where
        F: FnOnce(&mut Pool),
    {
        let dir = self.folders.validate(pool_id)?;
        let mut pool = Self::read_at(&dir)?;
        change(&mut pool);
        pool.assign_user_ids();
        pool.validate()?;
        self.check_cross_pool(&pool, Some(pool_id))?;
        Self::write_at(&dir, &pool)?;
        Ok(pool)
    }

    pub fn delete(&self, pool_id: &str) -> Result<(), PoolError> {
        self.folders.remove(pool_id)?;
        info!("Deleted pool {}", pool_id);
        Ok(())
    }

    /// Pool ids that reference `topology_id`
    pub fn using_topology(&self, topology_id: &str) -> Result<Vec<String>, PoolError> {
        Ok(self
            .others(None)?
            .into_iter()
            .filter(|(_, p)| p.topology_id == topology_id)
            .map(|(id, _)| id)
            .collect())
    }

    /// List view without member details
    pub fn summaries(&self) -> Result<Vec<Value>, PoolError> {
        let mut out = Vec::new();
        for item in self.folders.list()? {
            let dir = self.folders.base().join(&item.id);
            let pool = match Self::read_at(&dir) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("Skipping unreadable pool {}: {}", item.id, e);
                    continue;
                }
            };
            let mut summary = serde_json::to_value(&pool)?;
            if let Some(map) = summary.as_object_mut() {
                map.remove("mainUser");
                map.remove("usersAndTeams");
                map.insert("poolId".to_string(), Value::String(item.id.clone()));
                map.insert("ctfdData".to_string(), Value::Bool(dir.join(ctfd::DATA_FILE).exists()));
                let created = fs::metadata(dir.join(POOL_FILE))
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(item.created_at);
                map.insert("createdAt".to_string(), Value::String(timestamp(&created)));
            }
            out.push(summary);
        }
        Ok(out)
    }

    pub fn ctfd_data(&self, pool_id: &str) -> Result<Option<CtfdData>, PoolError> {
        let dir = self.folders.validate(pool_id)?;
        Ok(CtfdData::load(&dir)?)
    }

    /// Store generated credentials; an existing file is never overwritten
    pub fn save_ctfd_data(&self, pool_id: &str, data: &CtfdData) -> Result<bool, PoolError> {
        let dir = self.folders.validate(pool_id)?;
        if dir.join(ctfd::DATA_FILE).exists() {
            return Ok(false);
        }
        data.save(&dir)?;
        Ok(true)
    }

    pub fn delete_ctfd_data(&self, pool_id: &str) -> Result<(), PoolError> {
        let dir = self.folders.validate(pool_id)?;
        match fs::remove_file(dir.join(ctfd::DATA_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
