//! Role checks shared by listing, execution and history access.

use crate::error::{Result, WheelhouseError};
use crate::storage::{Command, User};

/// A command without a required role is open to every authenticated user.
pub fn is_authorized(user: &User, command: &Command) -> bool {
    match &command.role {
        None => true,
        Some(role) => user.has_role(role),
    }
}

pub fn ensure_authorized(user: &User, command: &Command) -> Result<()> {
    if is_authorized(user, command) {
        Ok(())
    } else {
        Err(WheelhouseError::Unauthorized)
    }
}

pub fn visible_commands(user: &User, commands: &[Command]) -> Vec<Command> {
    commands
        .iter()
        .filter(|cmd| is_authorized(user, cmd))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(roles: &[&str]) -> User {
        User {
            username: "op".to_string(),
            password_hash: String::new(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn open_commands_are_visible_to_everyone() {
        let cmd = Command::new("List", "ls -la", None);
        assert!(is_authorized(&user(&[]), &cmd));
        assert!(is_authorized(&user(&["admin"]), &cmd));
    }

    #[test]
    fn role_gated_commands_need_the_role() {
        let cmd = Command::new("Secret", "echo $SECRET", Some("admin"));
        assert!(!is_authorized(&user(&["developer"]), &cmd));
        assert!(is_authorized(&user(&["developer", "admin"]), &cmd));
        assert!(matches!(
            ensure_authorized(&user(&[]), &cmd),
            Err(WheelhouseError::Unauthorized)
        ));
    }

    #[test]
    fn visible_commands_keeps_catalog_order() {
        let commands = vec![
            Command::new("List", "ls -la", None),
            Command::new("Hello", "echo Hello", Some("developer")),
            Command::new("Echo secret", "echo $SECRET", Some("admin")),
            Command::new("Failing", "false", None),
        ];
        let names: Vec<_> = visible_commands(&user(&["developer"]), &commands)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["List", "Hello", "Failing"]);
    }
}
