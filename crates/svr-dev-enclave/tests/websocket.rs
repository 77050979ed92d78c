//! svr client over a real websocket against the dev enclave

use std::net::SocketAddr;
use std::sync::Arc;

use svr::{
    Argon2PinHasher, AuthCredentials, BackupResponse, DeleteResponse, EnclaveIdentity, MasterKey,
    RestoreResponse, SecureValueRecovery, SecureValueRecoveryV2, ServiceUrl, SoftwareAttestation,
    SoftwareEnclave, StaticCredentials, TungsteniteConnector,
};
use svr_dev_enclave::{router, AppState};

const MR_ENCLAVE: [u8; 32] = [0x42; 32];

async fn spawn_enclave() -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(SoftwareEnclave::new(MR_ENCLAVE)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });
    (addr, state)
}

fn client(addr: SocketAddr, mr_enclave: [u8; 32]) -> SecureValueRecoveryV2 {
    let identity =
        EnclaveIdentity::new(mr_enclave, vec![ServiceUrl::new(format!("ws://{addr}"))]).unwrap();
    SecureValueRecoveryV2::new(
        identity,
        Arc::new(TungsteniteConnector),
        Arc::new(SoftwareAttestation),
        Arc::new(StaticCredentials(AuthCredentials::new("alice", "pw"))),
    )
    .with_pin_hasher(Arc::new(Argon2PinHasher::with_cost(64, 1)))
}

#[tokio::test]
async fn test_backup_restore_delete_over_websocket() {
    let (addr, state) = spawn_enclave().await;
    let client = client(addr, MR_ENCLAVE);

    let master_key = MasterKey::generate();
    let mut session = client.set_pin("1234", master_key.clone());
    assert!(matches!(session.execute().await, BackupResponse::Success(_)));
    assert_eq!(state.enclave().record_count(), 1);

    match client.restore_data_post_registration("1234").await {
        RestoreResponse::Success(restored) => assert_eq!(restored, master_key),
        other => panic!("restore failed: {other:?}"),
    }
    assert!(matches!(
        client.restore_data_post_registration("4321").await,
        RestoreResponse::PinMismatch { tries_remaining: 9 }
    ));

    assert!(matches!(client.delete_data().await, DeleteResponse::Success));
    assert_eq!(state.enclave().record_count(), 0);
}

#[tokio::test]
async fn test_unknown_enclave_rejected_at_upgrade() {
    let (addr, state) = spawn_enclave().await;
    let client = client(addr, [0x01; 32]);

    assert!(matches!(
        client.restore_data_post_registration("1234").await,
        RestoreResponse::EnclaveNotFound
    ));
    assert_eq!(state.enclave().request_counts().restore, 0);
}

#[tokio::test]
async fn test_refused_expose_over_websocket() {
    let (addr, state) = spawn_enclave().await;
    state.enclave().set_refuse_expose(true);
    let client = client(addr, MR_ENCLAVE);

    let mut session = client.set_pin("1234", MasterKey::generate());
    assert!(matches!(session.execute().await, BackupResponse::ExposeFailure));
    assert!(session.is_setup_complete());
}
