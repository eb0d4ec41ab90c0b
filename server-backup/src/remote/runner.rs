//! Builds the backup commands and drives them through a session.

use super::{RemoteSession, Task};
use crate::credentials::DbCredentials;
use crate::layout::ProjectLayout;
use crate::log_buffer::LogBuffer;
use crate::utils::errors::Result;
use std::path::Path;
use std::sync::Arc;

/// Quote `raw` for a POSIX shell.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r#"'\''"#))
}

/// `cd` to the project's parent, then zip the project directory so archive
/// entries are rooted at the project name. Each exclusion is rendered as
/// `<base>/<glob>`.
pub fn archive_command(layout: &ProjectLayout, excludes: &[String]) -> String {
    let mut cmd = format!(
        "cd {} && zip -r9 {} {}",
        shell_quote(&layout.source_parent),
        shell_quote(&layout.remote_archive),
        shell_quote(&layout.base_name),
    );

    let patterns: Vec<String> = excludes
        .iter()
        .map(|glob| glob.trim().trim_start_matches('/'))
        .filter(|glob| !glob.is_empty())
        .map(|glob| shell_quote(&format!("{}/{}", layout.base_name, glob)))
        .collect();

    if !patterns.is_empty() {
        cmd.push_str(" -x ");
        cmd.push_str(&patterns.join(" "));
    }
    cmd
}

/// `mysqldump` piped through gzip into `remote_dump`.
pub fn dump_command(layout: &ProjectLayout, creds: &DbCredentials, remote_dump: &str) -> String {
    format!(
        "cd {} && mysqldump -v --host={} --port={} --user={} --password={} --add-drop-table {} | gzip -9 > {}",
        shell_quote(&layout.source_parent),
        shell_quote(&creds.host),
        creds.port,
        shell_quote(&creds.user),
        shell_quote(&creds.pass),
        shell_quote(&creds.name),
        shell_quote(remote_dump),
    )
}

pub fn delete_command(path: &str) -> String {
    format!("rm -rf {}", shell_quote(path))
}

pub fn read_command(path: &str) -> String {
    format!("cat {}", shell_quote(path))
}

/// Runs backup commands against one server-unit's session.
#[derive(Clone)]
pub struct RemoteCommandRunner {
    session: Arc<dyn RemoteSession>,
}

impl RemoteCommandRunner {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self { session }
    }

    pub fn remote_addr(&self) -> &str {
        self.session.remote_addr()
    }

    /// Create the project archive, streaming zip's output into `log`.
    pub async fn archive(&self, layout: &ProjectLayout, excludes: &[String], log: &LogBuffer) -> Result<()> {
        let mut task = Task::new(archive_command(layout, excludes));
        log.add_header(format!("$ {}", task.display()));
        task.run_live(self.session.as_ref(), log).await
    }

    /// Dump and compress the project database, streaming into `log`.
    pub async fn dump_database(
        &self,
        layout: &ProjectLayout,
        creds: &DbCredentials,
        remote_dump: &str,
        log: &LogBuffer,
    ) -> Result<()> {
        let mut task = Task::new(dump_command(layout, creds, remote_dump))
            .redact(&shell_quote(&creds.pass));
        log.add_header(format!("$ {}", task.display()));
        task.run_live(self.session.as_ref(), log).await
    }

    pub async fn delete_path(&self, path: &str) -> Result<()> {
        Task::new(delete_command(path))
            .execute(self.session.as_ref())
            .await
            .map(|_| ())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Task::new(read_command(path)).execute(self.session.as_ref()).await
    }

    pub async fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        tracing::debug!(addr = %self.remote_addr(), remote_path, local = %local_path.display(), "Pulling file");
        self.session.pull(remote_path, local_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ServerConfig};
    use crate::layout::RunDate;
    use crate::testing::FakeSession;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn layout(path: &str) -> ProjectLayout {
        let server = ServerConfig {
            name: "web".into(),
            host: "10.0.0.1".into(),
            port: 22,
            user: "root".into(),
            password: Some("pw".into()),
            private_key: None,
            project_root: "/var/www".into(),
            dest_path: PathBuf::from("/backups/web"),
            connect_timeout_secs: 15,
            s3: None,
            projects: Vec::new(),
        };
        let project = ProjectConfig {
            path: path.into(),
            ..Default::default()
        };
        let date = RunDate::new(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        ProjectLayout::resolve(&server, &project, date)
    }

    #[test]
    fn test_archive_exclusions_are_rooted_at_project_base() {
        let excludes = vec!["vendor".to_string(), "storage/*".to_string()];
        let cmd = archive_command(&layout("app"), &excludes);

        assert_eq!(
            cmd,
            "cd '/var/www' && zip -r9 '/var/www/2024-01-05_app.zip' 'app' -x 'app/vendor' 'app/storage/*'"
        );
        assert!(!cmd.contains("/var/www/app/vendor"));
    }

    #[test]
    fn test_archive_without_exclusions() {
        let cmd = archive_command(&layout("app"), &[]);
        assert!(!cmd.contains("-x"));
    }

    #[test]
    fn test_dump_command() {
        let creds = DbCredentials {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "shop".into(),
            pass: "it's".into(),
            name: "shop_db".into(),
        };
        let cmd = dump_command(&layout("app"), &creds, "/var/www/2024-01-05_app_shop_db.sql.gz");

        assert!(cmd.starts_with("cd '/var/www' && mysqldump"));
        assert!(cmd.contains("--host='127.0.0.1' --port=3306 --user='shop'"));
        assert!(cmd.contains(r#"--password='it'\''s'"#));
        assert!(cmd.ends_with("'shop_db' | gzip -9 > '/var/www/2024-01-05_app_shop_db.sql.gz'"));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(delete_command("/var/www/a b.zip"), "rm -rf '/var/www/a b.zip'");
        assert_eq!(read_command("/var/www/app/.env"), "cat '/var/www/app/.env'");
    }

    #[tokio::test]
    async fn test_dump_password_never_logged() {
        let session = Arc::new(FakeSession::new("10.0.0.1:22").on("mysqldump", 0, "-- Connecting to 127.0.0.1...\n"));
        let runner = RemoteCommandRunner::new(session.clone());
        let log = LogBuffer::new("test", false);
        let creds = DbCredentials {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "shop".into(),
            pass: "s3cr3t".into(),
            name: "shop".into(),
        };

        runner
            .dump_database(&layout("app"), &creds, "/var/www/dump.sql.gz", &log)
            .await
            .unwrap();

        let content = log.contents();
        assert!(content.contains("--password=****"));
        assert!(!content.contains("s3cr3t"));
        assert!(content.contains("Connecting to 127.0.0.1"));
        assert!(session.commands()[0].contains("s3cr3t"));
    }
}
