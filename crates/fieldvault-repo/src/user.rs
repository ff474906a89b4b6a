use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use fieldvault_core::{
    schema::{EncryptedModel, FieldAnnotation},
    store::Document,
};
use fieldvault_manager::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::repository::{Repository, Stored};

pub const USERS_COLLECTION: &str = "users";

/// Application user. The email is encrypted deterministically so it can be
/// looked up; the full name is encrypted with a random nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    pub full_name: String,
}

impl EncryptedModel for User {
    const NAME: &'static str = "User";

    fn fields() -> Vec<FieldAnnotation> {
        vec![
            FieldAnnotation::plain("username"),
            FieldAnnotation::queryable("email"),
            FieldAnnotation::standard("full_name"),
        ]
    }
}

impl User {
    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        validate_email(&self.email)?;
        ensure!(!self.full_name.trim().is_empty(), "full name must not be empty");
        Ok(())
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub full_name: Option<String>,
}

fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    ensure!(
        (3..=50).contains(&len),
        "username must be 3 to 50 characters, got {len}"
    );
    ensure!(
        username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            && username.chars().any(char::is_alphanumeric),
        "username must be alphanumeric (underscores and hyphens allowed)"
    );
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    ensure!(valid, "invalid email address {email:?}");
    Ok(())
}

pub struct UserRepository {
    users: Repository<User>,
}

impl UserRepository {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            users: Repository::new(manager, USERS_COLLECTION),
        }
    }

    /// Validate and store a new user. Email and username must be unused by
    /// any live user.
    #[instrument(skip_all, fields(username = %user.username))]
    pub async fn create_user(&self, user: User) -> Result<Stored<User>> {
        user.validate()?;
        if self.get_by_email(&user.email).await?.is_some() {
            bail!("email already registered");
        }
        if self.get_by_username(&user.username).await?.is_some() {
            bail!("username already taken");
        }

        let created = self.users.create(user).await?;
        info!(id = %created.id, "user created");
        Ok(created)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<Stored<User>>> {
        self.users.get_by_id(id).await
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<Stored<User>>> {
        self.users.find_one(field("email", email)).await
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<Stored<User>>> {
        self.users.find_one(field("username", username)).await
    }

    pub async fn get_all_users(&self, skip: usize, limit: usize) -> Result<Vec<Stored<User>>> {
        self.users.get_all(skip, limit).await
    }

    /// `None` when no live user has this id.
    #[instrument(skip(self, update))]
    pub async fn update_user(&self, id: &str, update: UserUpdate) -> Result<Option<Stored<User>>> {
        let mut fields = Document::new();
        if let Some(email) = update.email {
            validate_email(&email)?;
            if let Some(owner) = self.get_by_email(&email).await? {
                ensure!(owner.id == id, "email already registered");
            }
            fields.insert("email".into(), Value::String(email));
        }
        if let Some(full_name) = update.full_name {
            ensure!(!full_name.trim().is_empty(), "full name must not be empty");
            fields.insert("full_name".into(), Value::String(full_name));
        }
        self.users.update(id, fields).await
    }

    /// Soft delete. `false` when no live user has this id.
    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        self.users.delete(id).await
    }
}

fn field(name: &str, value: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(name.to_string(), json!(value));
    filter
}
