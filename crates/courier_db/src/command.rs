//! Acknowledgement tracking on top of a [`Db`].

use crate::entity::CommandEntity;
use crate::error::Result;
use crate::Db;
use std::sync::Arc;
use tracing::{debug, warn};

/// Command bookkeeping for an external acker.
#[derive(Clone)]
pub struct CommandDb {
    db: Arc<dyn Db>,
}

impl CommandDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    /// Store a command as delivered and not yet acknowledged.
    pub fn store_command(&self, mut command: CommandEntity) -> Result<()> {
        command.acked = false;
        if let Some(previous) = self.db.put_command(command.clone())? {
            debug!(
                command_id = %command.id,
                previous_version = previous.version,
                version = command.version,
                "command redelivered"
            );
        }
        Ok(())
    }

    /// Mark a command acknowledged. Unknown ids return `false`.
    pub fn ack_command(&self, id: &str) -> Result<bool> {
        let Some(mut command) = self.db.get_command(id)? else {
            warn!(command_id = %id, "ack for unknown command");
            return Ok(false);
        };
        if !command.acked {
            command.acked = true;
            self.db.put_command(command)?;
        }
        Ok(true)
    }

    /// Commands still waiting for an ack, oldest delivery first.
    pub fn unacked_commands(&self) -> Result<Vec<CommandEntity>> {
        self.db.search_commands(false)
    }

    pub fn acked_commands(&self) -> Result<Vec<CommandEntity>> {
        self.db.search_commands(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteDb;

    #[test]
    fn test_ack_moves_command_between_sets() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let commands = CommandDb::new(db);

        commands.store_command(CommandEntity::new("c1", "task-1", 1)).unwrap();
        commands.store_command(CommandEntity::new("c2", "task-2", 1)).unwrap();
        assert_eq!(commands.unacked_commands().unwrap().len(), 2);

        assert!(commands.ack_command("c1").unwrap());
        assert!(commands.ack_command("c1").unwrap());
        assert!(!commands.ack_command("nope").unwrap());

        let unacked: Vec<_> = commands
            .unacked_commands()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(unacked, vec!["c2"]);
        assert_eq!(commands.acked_commands().unwrap()[0].id, "c1");
    }

    #[test]
    fn test_redelivery_resets_ack() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let commands = CommandDb::new(db.clone());

        commands.store_command(CommandEntity::new("c1", "task-1", 1)).unwrap();
        commands.ack_command("c1").unwrap();
        commands.store_command(CommandEntity::new("c1", "task-1", 2)).unwrap();

        let stored = db.get_command("c1").unwrap().unwrap();
        assert!(!stored.acked);
        assert_eq!(stored.version, 2);
    }
}
