// ABOUTME: Integration test for the online key-rotation migration
// ABOUTME: Old-version rows re-encrypt in batches while staying readable

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use link_broker::crypto::{rotate_stored_secrets, MasterKeyRing, SecretCipher};
use link_broker::models::{ApiKeyPair, ApiKeyStatus, Connection, ConnectionStatus, EnvironmentTag};
use link_broker::store::{MemoryStore, Store};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn rotation_reencrypts_old_rows_and_keeps_plaintexts() {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn Store> = Arc::clone(&memory) as Arc<dyn Store>;

    // seed rows under key version 1
    let old_key = link_broker::crypto::generate_key();
    let old_cipher = SecretCipher::new(MasterKeyRing::new(old_key));

    let project_id = Uuid::new_v4();
    let now = Utc::now();

    let mut connection_ids = Vec::new();
    for i in 0..5 {
        let user = store
            .upsert_end_user(project_id, &format!("user-{i}"))
            .await
            .unwrap();
        let connection = Connection {
            id: Connection::new_id(),
            project_id,
            provider: "mock".into(),
            end_user_id: user.id,
            provider_user_id: None,
            provider_email: None,
            access_token_encrypted: old_cipher.encrypt_str(&format!("access-{i}")).unwrap(),
            refresh_token_encrypted: Some(
                old_cipher.encrypt_str(&format!("refresh-{i}")).unwrap(),
            ),
            token_type: "Bearer".into(),
            expires_at: None,
            scopes: vec![],
            status: ConnectionStatus::Active,
            error_message: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        let stored = store.upsert_connection(&connection).await.unwrap();
        connection_ids.push(stored.id);
    }

    let api_key = ApiKeyPair {
        id: Uuid::new_v4(),
        project_id,
        public_key: "pk_test_rotation".into(),
        secret_encrypted: old_cipher.encrypt_str("sk_test_rotation_secret").unwrap(),
        environment: EnvironmentTag::Test,
        status: ApiKeyStatus::Active,
        last_used_at: None,
        created_at: now,
    };
    memory.seed_api_key(api_key.clone()).await;

    // rotated cipher: old key retired at version 1, new current at 2
    let mut retired = HashMap::new();
    retired.insert(1u8, old_key);
    let rotated = SecretCipher::new(MasterKeyRing::with_retired(
        link_broker::crypto::generate_key(),
        retired,
    ));
    assert_eq!(rotated.current_version(), 2);

    let report = rotate_stored_secrets(&store, &rotated).await.unwrap();
    assert_eq!(report.connections, 5);
    assert_eq!(report.api_keys, 1);

    // every row now carries the current version and still decrypts
    for (i, id) in connection_ids.iter().enumerate() {
        let connection = store.get_connection(id).await.unwrap().unwrap();
        assert_eq!(
            SecretCipher::stored_version(&connection.access_token_encrypted).unwrap(),
            rotated.current_version()
        );
        assert_eq!(
            rotated.decrypt_str(&connection.access_token_encrypted).unwrap(),
            format!("access-{i}")
        );
        assert_eq!(
            rotated
                .decrypt_str(connection.refresh_token_encrypted.as_ref().unwrap())
                .unwrap(),
            format!("refresh-{i}")
        );
    }

    let key = store
        .get_api_key_by_public_key("pk_test_rotation")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        SecretCipher::stored_version(&key.secret_encrypted).unwrap(),
        rotated.current_version()
    );
    assert_eq!(
        rotated.decrypt_str(&key.secret_encrypted).unwrap(),
        "sk_test_rotation_secret"
    );

    // a second pass is a no-op
    let report = rotate_stored_secrets(&store, &rotated).await.unwrap();
    assert_eq!(report.connections, 0);
    assert_eq!(report.api_keys, 0);
    assert_eq!(report.already_current, 6);
}
