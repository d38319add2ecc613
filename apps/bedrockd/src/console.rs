use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Operator commands accepted on the supervisor's own stdin. Anything
/// unrecognized is piped verbatim to the server console.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Backup,
    Stop,
    ForceRestore(String),
    /// `save …` is intercepted so operators cannot race the negotiation.
    InterceptedSave,
    ResourceUsage,
    /// `force-restore` with no archive name.
    ForceRestoreUsage,
    Passthrough(String),
}

pub fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();

    if lower == "stop" || lower == "exit" {
        return Some(ConsoleCommand::Stop);
    }
    if lower == "backup" {
        return Some(ConsoleCommand::Backup);
    }
    if lower.starts_with("save") {
        return Some(ConsoleCommand::InterceptedSave);
    }
    if lower == "resource-usage" {
        return Some(ConsoleCommand::ResourceUsage);
    }
    if let Some(rest) = trimmed.strip_prefix("force-restore") {
        let name = rest.trim();
        if name.is_empty() {
            return Some(ConsoleCommand::ForceRestoreUsage);
        }
        return Some(ConsoleCommand::ForceRestore(name.to_string()));
    }
    Some(ConsoleCommand::Passthrough(trimmed.to_string()))
}

/// Reads operator lines off stdin on a background task.
pub fn spawn_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_lifecycle_commands() {
        assert_eq!(parse_command("stop"), Some(ConsoleCommand::Stop));
        assert_eq!(parse_command("EXIT"), Some(ConsoleCommand::Stop));
        assert_eq!(parse_command("backup"), Some(ConsoleCommand::Backup));
    }

    #[test]
    fn intercepts_raw_save_commands() {
        assert_eq!(parse_command("save hold"), Some(ConsoleCommand::InterceptedSave));
        assert_eq!(parse_command("save query"), Some(ConsoleCommand::InterceptedSave));
    }

    #[test]
    fn resource_usage_is_handled_by_the_supervisor() {
        assert_eq!(parse_command("resource-usage"), Some(ConsoleCommand::ResourceUsage));
        assert_eq!(parse_command("Resource-Usage"), Some(ConsoleCommand::ResourceUsage));
    }

    #[test]
    fn force_restore_carries_the_archive_name() {
        assert_eq!(
            parse_command("force-restore 100_MANUAL.tar.gz"),
            Some(ConsoleCommand::ForceRestore("100_MANUAL.tar.gz".to_string()))
        );
        assert_eq!(parse_command("force-restore"), Some(ConsoleCommand::ForceRestoreUsage));
    }

    #[test]
    fn unknown_lines_pass_through_to_the_server() {
        assert_eq!(
            parse_command("list"),
            Some(ConsoleCommand::Passthrough("list".to_string()))
        );
        assert_eq!(parse_command("   "), None);
    }
}
