//! Integration tests for the telecast-core database layer.
//!
//! These exercise the sqlx repositories against a real in-memory SQLite database
//! with migrations applied, rather than mocking the pool.

use telecast_core::database::repositories::{
    SqlxAccountRepository, SqlxAuditEventRepository, SqlxChannelRepository, SqlxPlaylistItemRepository,
    SqlxSchedulerTriggerRepository,
};
use telecast_core::database::{init_pool, run_migrations, DbPool};
use telecast_core::domain::{
    Account, AccountState, AuditEvent, AuditEventFilter, AuditOutcome, Channel, DesiredState, FireSchedule,
    ItemStatus, ObservedState, PlaylistItem, Recurrence, SchedulerTrigger, SessionMaterial, Source, SourceKind,
    StreamKind,
};

async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:").await.expect("failed to create test pool");
    run_migrations(&pool).await.expect("failed to run migrations");
    pool
}

fn test_encryption_key() -> Vec<u8> {
    vec![9u8; 32]
}

fn sample_channel(id: &str, account_id: &str) -> Channel {
    Channel {
        id: id.to_string(),
        account_id: account_id.to_string(),
        target_chat_id: "-100123".to_string(),
        display_name: "Lofi Radio".to_string(),
        stream_kind: StreamKind::Audio,
        encoder_params: "{}".to_string(),
        placeholder_media_ref: None,
        desired_state: DesiredState::Stopped,
        observed_state: ObservedState::Stopped,
    }
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_all_expected_tables() {
        let pool = setup_test_db().await;

        let tables: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&pool)
            .await
            .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();

        for expected in [
            "accounts",
            "channels",
            "playlist_items",
            "worker_records",
            "scheduler_triggers",
            "audit_events",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }
}

mod account_tests {
    use super::*;

    #[tokio::test]
    async fn create_and_load_round_trips_account() {
        let pool = setup_test_db().await;
        let repo = SqlxAccountRepository::new(pool, test_encryption_key());

        let account = Account::new("acc-1", "op-1", "Main account", SessionMaterial::new("abc123"));
        repo.create(&account).await.unwrap();

        let loaded = repo.load("acc-1").await.unwrap();
        assert_eq!(loaded.id, "acc-1");
        assert_eq!(loaded.state, AccountState::Active);
        assert_eq!(loaded.session_material.reveal_for_transport(), "abc123");
    }

    #[tokio::test]
    async fn replace_session_material_overwrites_ciphertext() {
        let pool = setup_test_db().await;
        let repo = SqlxAccountRepository::new(pool, test_encryption_key());

        let account = Account::new("acc-2", "op-1", "Secondary", SessionMaterial::new("original"));
        repo.create(&account).await.unwrap();

        repo.replace_session_material("acc-2", &SessionMaterial::new("rotated")).await.unwrap();

        let loaded = repo.load("acc-2").await.unwrap();
        assert_eq!(loaded.session_material.reveal_for_transport(), "rotated");
    }

    #[tokio::test]
    async fn list_returns_all_created_accounts() {
        let pool = setup_test_db().await;
        let repo = SqlxAccountRepository::new(pool, test_encryption_key());

        repo.create(&Account::new("acc-a", "op-1", "A", SessionMaterial::new("x"))).await.unwrap();
        repo.create(&Account::new("acc-b", "op-1", "B", SessionMaterial::new("y"))).await.unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}

mod channel_tests {
    use super::*;

    async fn seeded_account(repo: &SqlxAccountRepository, id: &str) {
        repo.create(&Account::new(id, "op-1", "Owner", SessionMaterial::new("tok"))).await.unwrap();
    }

    #[tokio::test]
    async fn create_and_load_round_trips_channel() {
        let pool = setup_test_db().await;
        let accounts = SqlxAccountRepository::new(pool.clone(), test_encryption_key());
        let channels = SqlxChannelRepository::new(pool);

        seeded_account(&accounts, "acc-1").await;
        channels.create(&sample_channel("chan-1", "acc-1")).await.unwrap();

        let loaded = channels.load("chan-1").await.unwrap();
        assert_eq!(loaded.account_id, "acc-1");
        assert_eq!(loaded.desired_state, DesiredState::Stopped);
    }

    #[tokio::test]
    async fn set_desired_state_is_observable_in_list_desired_running() {
        use telecast_core::process::ChannelStore;

        let pool = setup_test_db().await;
        let accounts = SqlxAccountRepository::new(pool.clone(), test_encryption_key());
        let channels = SqlxChannelRepository::new(pool);

        seeded_account(&accounts, "acc-1").await;
        channels.create(&sample_channel("chan-1", "acc-1")).await.unwrap();

        let running = channels.list_desired_running().await.unwrap();
        assert!(running.is_empty());

        channels.set_desired_state("chan-1", DesiredState::Running).await.unwrap();
        let running = channels.list_desired_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "chan-1");
    }

    #[tokio::test]
    async fn delete_removes_channel() {
        let pool = setup_test_db().await;
        let accounts = SqlxAccountRepository::new(pool.clone(), test_encryption_key());
        let channels = SqlxChannelRepository::new(pool);

        seeded_account(&accounts, "acc-1").await;
        channels.create(&sample_channel("chan-1", "acc-1")).await.unwrap();
        channels.delete("chan-1").await.unwrap();

        assert!(channels.load("chan-1").await.is_err());
    }
}

mod playlist_item_tests {
    use super::*;

    #[tokio::test]
    async fn create_load_and_set_status_round_trip() {
        let pool = setup_test_db().await;
        let accounts = SqlxAccountRepository::new(pool.clone(), test_encryption_key());
        let channels = SqlxChannelRepository::new(pool.clone());
        let items = SqlxPlaylistItemRepository::new(pool);

        accounts.create(&Account::new("acc-1", "op-1", "Owner", SessionMaterial::new("tok"))).await.unwrap();
        channels.create(&sample_channel("chan-1", "acc-1")).await.unwrap();

        let item = PlaylistItem {
            id: "item-1".to_string(),
            channel_id: "chan-1".to_string(),
            source: Source { kind: SourceKind::WebUrl, value: "https://example.com/track.mp3".to_string() },
            title: Some("Track One".to_string()),
            duration_seconds: Some(180),
            thumbnail: None,
            computed_codec_profile: None,
            status: ItemStatus::Queued,
            requester_principal_id: None,
            requester_role: None,
            created_at: chrono::Utc::now(),
        };
        items.create(&item).await.unwrap();

        let loaded = items.load("item-1").await.unwrap();
        assert_eq!(loaded.status, ItemStatus::Queued);

        items.set_status("item-1", ItemStatus::Played).await.unwrap();
        let loaded = items.load("item-1").await.unwrap();
        assert_eq!(loaded.status, ItemStatus::Played);

        let for_channel = items.list_for_channel("chan-1").await.unwrap();
        assert_eq!(for_channel.len(), 1);
    }
}

mod scheduler_trigger_tests {
    use super::*;

    #[tokio::test]
    async fn trigger_store_resolves_playlist_item_through_the_playlist_repository() {
        use telecast_core::scheduler::TriggerStore;
        use std::sync::Arc;

        let pool = setup_test_db().await;
        let accounts = SqlxAccountRepository::new(pool.clone(), test_encryption_key());
        let channels = SqlxChannelRepository::new(pool.clone());
        let playlist_items = Arc::new(SqlxPlaylistItemRepository::new(pool.clone()));
        let triggers = SqlxSchedulerTriggerRepository::new(pool.clone(), playlist_items.clone());

        accounts.create(&Account::new("acc-1", "op-1", "Owner", SessionMaterial::new("tok"))).await.unwrap();
        channels.create(&sample_channel("chan-1", "acc-1")).await.unwrap();
        playlist_items
            .create(&PlaylistItem {
                id: "item-1".to_string(),
                channel_id: "chan-1".to_string(),
                source: Source { kind: SourceKind::WebUrl, value: "https://example.com/track.mp3".to_string() },
                title: None,
                duration_seconds: None,
                thumbnail: None,
                computed_codec_profile: None,
                status: ItemStatus::Queued,
                requester_principal_id: None,
                requester_role: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let trigger = SchedulerTrigger {
            id: "trig-1".to_string(),
            channel_id: "chan-1".to_string(),
            playlist_ref: "item-1".to_string(),
            schedule: FireSchedule::WallTime { at: chrono::Utc::now() },
            recurrence: Recurrence::Once,
            enabled: true,
        };
        triggers.create(&trigger).await.unwrap();

        let enabled = TriggerStore::list_enabled(&triggers).await.unwrap();
        assert_eq!(enabled.len(), 1);

        let resolved = TriggerStore::load_playlist_item(&triggers, &enabled[0].playlist_ref).await.unwrap();
        assert_eq!(resolved.id, "item-1");

        TriggerStore::disable(&triggers, "trig-1").await.unwrap();
        let enabled = TriggerStore::list_enabled(&triggers).await.unwrap();
        assert!(enabled.is_empty());
    }
}

mod audit_event_tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_filter_by_channel_id() {
        let pool = setup_test_db().await;
        let repo = SqlxAuditEventRepository::new(pool);

        repo.insert(&AuditEvent::new(
            "evt-1",
            "op-1",
            "admin",
            "create_channel",
            Some("chan-1".to_string()),
            AuditOutcome::Ok,
            "created",
        ))
        .await
        .unwrap();
        repo.insert(&AuditEvent::new(
            "evt-2",
            "op-1",
            "admin",
            "create_channel",
            Some("chan-2".to_string()),
            AuditOutcome::Ok,
            "created",
        ))
        .await
        .unwrap();

        let filter = AuditEventFilter { channel_id: Some("chan-1".to_string()), ..Default::default() };
        let results = repo.list(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "evt-1");
    }
}
