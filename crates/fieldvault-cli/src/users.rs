use std::sync::Arc;

use color_eyre::Result;
use fieldvault_manager::ConnectionManager;
use fieldvault_repo::{Stored, User, UserRepository, UserUpdate};

use crate::cli::UserCommand;

/// Execute a user subcommand through the connection manager.
pub async fn handle(cmd: UserCommand, manager: Arc<ConnectionManager>) -> Result<()> {
    let users = UserRepository::new(manager);

    match cmd {
        UserCommand::Add {
            username,
            email,
            full_name,
        } => {
            let user = users
                .create_user(User {
                    username,
                    email,
                    full_name,
                })
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            println!("Created user {}", describe(&user));
        }
        UserCommand::List { skip, limit } => {
            let all = users
                .get_all_users(skip, limit)
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            if all.is_empty() {
                println!("No users yet. Add one with `fieldvault user add <username> <email> <full name>`.");
                return Ok(());
            }
            for user in &all {
                println!("{}", describe(user));
            }
        }
        UserCommand::Find { email, username } => {
            let found = match (email, username) {
                (Some(email), _) => users.get_by_email(&email).await,
                (None, Some(username)) => users.get_by_username(&username).await,
                (None, None) => color_eyre::eyre::bail!("pass --email or --username"),
            }
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            match found {
                Some(user) => println!("{}", describe(&user)),
                None => println!("No matching user."),
            }
        }
        UserCommand::Update {
            id,
            email,
            full_name,
        } => {
            let updated = users
                .update_user(&id, UserUpdate { email, full_name })
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            match updated {
                Some(user) => println!("Updated {}", describe(&user)),
                None => color_eyre::eyre::bail!("no user with id {id} (or nothing changed)"),
            }
        }
        UserCommand::Delete { id } => {
            let deleted = users
                .delete_user(&id)
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            if !deleted {
                color_eyre::eyre::bail!("no user with id {id}");
            }
            println!("Deleted user {id}");
        }
    }

    Ok(())
}

fn describe(user: &Stored<User>) -> String {
    format!(
        "{} {} <{}> {}",
        user.id, user.record.username, user.record.email, user.record.full_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    fn add(username: &str, email: &str) -> UserCommand {
        UserCommand::Add {
            username: username.into(),
            email: email.into(),
            full_name: "Test User".into(),
        }
    }

    #[tokio::test]
    async fn add_find_and_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = storage::test_manager(dir.path());

        handle(add("ada", "ada@example.com"), manager.clone())
            .await
            .expect("add");
        handle(
            UserCommand::Find {
                email: Some("ada@example.com".into()),
                username: None,
            },
            manager.clone(),
        )
        .await
        .expect("find");

        let repo = UserRepository::new(manager.clone());
        let ada = repo
            .get_by_username("ada")
            .await
            .expect("lookup")
            .expect("present");
        assert!(dir.path().join("master_key.bin").exists());

        handle(UserCommand::Delete { id: ada.id.clone() }, manager.clone())
            .await
            .expect("delete");
        let err = handle(UserCommand::Delete { id: ada.id }, manager.clone())
            .await
            .expect_err("already deleted");
        assert!(err.to_string().contains("no user with id"));
        manager.close().await;
    }

    #[tokio::test]
    async fn duplicate_add_reports_the_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = storage::test_manager(dir.path());

        handle(add("ada", "ada@example.com"), manager.clone())
            .await
            .expect("add");
        let err = handle(add("ada2", "ada@example.com"), manager)
            .await
            .expect_err("duplicate");
        assert_eq!(err.to_string(), "email already registered");
    }
}
