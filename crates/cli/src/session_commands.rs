use {anyhow::Result, clap::Subcommand};

use herald_whatsapp::{CredentialStore, validate_session_id};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List session ids with stored credentials.
    List {
        /// Print a JSON array instead of one id per line.
        #[arg(long)]
        json: bool,
    },
    /// Purge every stored credential record of a session.
    Delete { session_id: String },
}

pub async fn handle_sessions(action: &SessionAction, store: &dyn CredentialStore) -> Result<()> {
    match action {
        SessionAction::List { json } => list(store, *json).await,
        SessionAction::Delete { session_id } => delete(store, session_id).await,
    }
}

async fn list(store: &dyn CredentialStore, json: bool) -> Result<()> {
    let ids = store.sessions().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ids)?);
    } else if ids.is_empty() {
        println!("No stored sessions.");
    } else {
        for id in ids {
            println!("{id}");
        }
    }
    Ok(())
}

async fn delete(store: &dyn CredentialStore, session_id: &str) -> Result<()> {
    validate_session_id(session_id)?;
    match store.delete_session(session_id).await? {
        0 => println!("Session {session_id} not found."),
        n => println!("Session {session_id} deleted ({n} records)."),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, herald_whatsapp::SledCredentialStore};

    #[tokio::test]
    async fn delete_removes_only_the_named_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledCredentialStore::open(&dir.path().join("credentials")).unwrap();
        store.write("s1", "creds", b"a").await.unwrap();
        store.write("s2", "creds", b"b").await.unwrap();

        handle_sessions(
            &SessionAction::Delete {
                session_id: "s1".into(),
            },
            &store,
        )
        .await
        .unwrap();
        assert_eq!(store.sessions().await.unwrap(), vec!["s2".to_string()]);

        assert!(
            handle_sessions(
                &SessionAction::Delete {
                    session_id: "bad id".into(),
                },
                &store,
            )
            .await
            .is_err()
        );
        handle_sessions(&SessionAction::List { json: true }, &store)
            .await
            .unwrap();
    }
}
