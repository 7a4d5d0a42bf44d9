//! Shared fixtures for cross-service tests.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::models::{
    AgentProfile, Element, ElementKind, EntityData, EntityType,
};
use crate::session::{LaunchSpec, ProcessLauncher};
use crate::storage::{Database, ElementStore};
use crate::{FoundryError, Result};

/// In-memory migrated store.
pub async fn memory_store() -> ElementStore {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    ElementStore::new(db)
}

/// A worker agent entity with the given profile tweaks applied.
pub async fn worker_entity(
    store: &ElementStore,
    name: &str,
    tweak: impl FnOnce(&mut AgentProfile),
) -> Element {
    let mut element = Element::new(
        ElementKind::Entity(EntityData {
            name: name.to_string(),
            entity_type: EntityType::Agent,
            is_active: Some(true),
        }),
        "el-sys",
    );
    let mut profile = AgentProfile::worker();
    tweak(&mut profile);
    profile.write_to(&mut element);
    store.create(element).await.unwrap()
}

/// Scripted stand-in for the agent CLI: `sh -c <script>` with the spawn
/// contract's pipes. The resume handle reaches the script as
/// `$FOUNDRY_RESUME`.
pub struct ShellLauncher {
    script: String,
}

pub fn shell_launcher(script: &str) -> Arc<ShellLauncher> {
    Arc::new(ShellLauncher {
        script: script.to_string(),
    })
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child> {
        let mut command = Command::new("sh");
        command
            .args(["-c", &self.script])
            .env(
                "FOUNDRY_RESUME",
                spec.resume_provider_session_id.as_deref().unwrap_or(""),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.spawn().map_err(|e| FoundryError::Agent {
            message: format!("failed to spawn scripted agent: {e}"),
        })
    }
}

/// Init then idle until stdin closes or a shutdown line arrives.
pub const WELL_BEHAVED: &str = r#"
echo '{"type":"init","providerSessionId":"prov-123"}'
while read line; do
  case "$line" in
    *shutdown*) exit 0 ;;
  esac
done
"#;

/// Init, wait for the task prompt, report a result, exit cleanly.
pub const ONE_SHOT_SUCCESS: &str = r#"
echo '{"type":"init","providerSessionId":"prov-oneshot"}'
read line
echo '{"type":"result","result":{"content":"task closed"}}'
echo '{"type":"exit","code":0}'
"#;

/// Seeded git repository for worktree-touching tests.
pub async fn git_repo() -> tempfile::TempDir {
    let dir = tempfile::TempDir::new().unwrap();
    let run = |args: Vec<&'static str>, dir: std::path::PathBuf| async move {
        let out = Command::new("git")
            .args(&args)
            .current_dir(&dir)
            .output()
            .await
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    };
    run(vec!["init", "--initial-branch=main"], dir.path().to_path_buf()).await;
    run(
        vec!["config", "user.email", "test@example.com"],
        dir.path().to_path_buf(),
    )
    .await;
    run(vec!["config", "user.name", "Test"], dir.path().to_path_buf()).await;
    tokio::fs::write(dir.path().join("README.md"), "seed\n")
        .await
        .unwrap();
    run(vec!["add", "-A"], dir.path().to_path_buf()).await;
    run(vec!["commit", "-m", "seed"], dir.path().to_path_buf()).await;
    dir
}

/// Poll an async predicate until it holds or five seconds elapse.
pub async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
