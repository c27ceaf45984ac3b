//! Primary/replica replication.
//!
//! A process is either a primary or a replica for its whole lifetime; the
//! role is chosen from `replicaof` at startup.

pub mod primary;
pub mod replica;

pub use primary::{Primary, WaitOutcome};
pub use replica::{LinkEvent, LinkState, ReplicaLink};

#[derive(Debug)]
pub enum Replication {
    Primary(Primary),
    Replica(ReplicaLink),
}

impl Replication {
    pub fn is_replica(&self) -> bool {
        matches!(self, Replication::Replica(_))
    }

    /// Replication offset as reported to clients.
    pub fn offset(&self) -> u64 {
        match self {
            Replication::Primary(primary) => primary.offset(),
            Replication::Replica(link) => link.offset(),
        }
    }

    /// Body of `INFO replication`.
    pub fn info(&self) -> String {
        let fields: Vec<(&str, String)> = match self {
            Replication::Primary(primary) => vec![
                ("role", "master".to_string()),
                ("connected_slaves", primary.connected_replicas().to_string()),
                ("master_replid", primary.replid().to_string()),
                ("master_repl_offset", primary.offset().to_string()),
            ],
            Replication::Replica(link) => vec![
                ("role", "slave".to_string()),
                ("master_host", link.host().to_string()),
                ("master_port", link.port().to_string()),
                (
                    "master_link_status",
                    if link.is_up() { "up" } else { "down" }.to_string(),
                ),
                ("master_replid", link.replid().unwrap_or("?").to_string()),
                ("master_repl_offset", link.offset().to_string()),
                ("slave_repl_offset", link.offset().to_string()),
            ],
        };

        fields.iter().fold(
            String::from("# Replication\r\n"),
            |mut info, (name, value)| {
                info.push_str(name);
                info.push(':');
                info.push_str(value);
                info.push_str("\r\n");
                info
            },
        )
    }
}
