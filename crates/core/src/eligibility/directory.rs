use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::UserId;
use crate::domain::tier::normalize_key;

/// Identity directory the engine consults for roles and org hierarchy.
pub trait DirectoryClient {
    fn users_with_role(&self, role: &str) -> Result<Vec<UserId>, String>;
    fn has_role(&self, user_id: &UserId, role: &str) -> Result<bool, String>;
    fn manager_of(&self, user_id: &UserId) -> Result<Option<UserId>, String>;
    fn department_of(&self, user_id: &UserId) -> Result<Option<String>, String>;
    fn department_head(&self, department: &str) -> Result<Option<UserId>, String>;
    fn executives(&self) -> Result<Vec<UserId>, String>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub manager_id: Option<UserId>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub is_executive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub name: String,
    pub head_id: UserId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    #[serde(default)]
    pub departments: Vec<Department>,
}

#[derive(Debug, Error)]
pub enum DirectoryFileError {
    #[error("could not read directory file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse directory file `{path}`: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    users: HashMap<UserId, DirectoryUser>,
    department_heads: HashMap<String, UserId>,
}

impl InMemoryDirectory {
    pub fn new(users: Vec<DirectoryUser>, departments: Vec<Department>) -> Self {
        Self {
            users: users.into_iter().map(|user| (user.id.clone(), user)).collect(),
            department_heads: departments
                .into_iter()
                .map(|department| (normalize_key(&department.name), department.head_id))
                .collect(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, DirectoryFileError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| DirectoryFileError::Read { path: path.to_path_buf(), source })?;
        let file: DirectoryFile = toml::from_str(&raw)
            .map_err(|source| DirectoryFileError::Parse { path: path.to_path_buf(), source })?;
        Ok(Self::new(file.users, file.departments))
    }

    pub fn with_user(mut self, user: DirectoryUser) -> Self {
        self.users.insert(user.id.clone(), user);
        self
    }

    pub fn with_department(mut self, name: &str, head_id: UserId) -> Self {
        self.department_heads.insert(normalize_key(name), head_id);
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl DirectoryClient for InMemoryDirectory {
    fn users_with_role(&self, role: &str) -> Result<Vec<UserId>, String> {
        let role = normalize_key(role);
        let mut users: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.roles.iter().any(|held| normalize_key(held) == role))
            .map(|user| user.id.clone())
            .collect();
        users.sort();
        Ok(users)
    }

    fn has_role(&self, user_id: &UserId, role: &str) -> Result<bool, String> {
        let role = normalize_key(role);
        Ok(self
            .users
            .get(user_id)
            .map(|user| user.roles.iter().any(|held| normalize_key(held) == role))
            .unwrap_or(false))
    }

    fn manager_of(&self, user_id: &UserId) -> Result<Option<UserId>, String> {
        Ok(self.users.get(user_id).and_then(|user| user.manager_id.clone()))
    }

    fn department_of(&self, user_id: &UserId) -> Result<Option<String>, String> {
        Ok(self.users.get(user_id).and_then(|user| user.department.clone()))
    }

    fn department_head(&self, department: &str) -> Result<Option<UserId>, String> {
        Ok(self.department_heads.get(&normalize_key(department)).cloned())
    }

    fn executives(&self) -> Result<Vec<UserId>, String> {
        let mut users: Vec<UserId> =
            self.users.values().filter(|user| user.is_executive).map(|user| user.id.clone()).collect();
        users.sort();
        Ok(users)
    }
}
