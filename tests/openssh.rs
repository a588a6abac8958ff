//! Interop test against a real OpenSSH server
//!
//! Needs a local docker daemon: `cargo test -- --ignored`

use std::time::Duration;

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt};

use ssh_fleet::{
    Dispatcher, Endpoint, ErrorKind, HostKeyPolicy, Operation, PoolConfig, Request, SessionPool,
};

const SSH_PORT: u16 = 2222;

#[tokio::test]
#[ignore = "requires docker"]
async fn test_batch_against_openssh_container() {
    let container = GenericImage::new("lscr.io/linuxserver/openssh-server", "latest")
        .with_exposed_port(SSH_PORT.tcp())
        .with_wait_for(WaitFor::message_on_stdout("done."))
        .with_env_var("PASSWORD_ACCESS", "true")
        .with_env_var("USER_NAME", "fleet")
        .with_env_var("USER_PASSWORD", "fleet")
        .start()
        .await
        .unwrap();

    let host = container.get_host().await.unwrap().to_string();
    let port = container.get_host_port_ipv4(SSH_PORT.tcp()).await.unwrap();
    let endpoint = Endpoint::with_password(host, "fleet", "fleet").port(port);

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("remote-check.sh");
    std::fs::write(&script, "#!/bin/sh\necho check-ok\n").unwrap();

    let config = PoolConfig::new(HostKeyPolicy::AcceptAny)
        .with_connect_timeout(Duration::from_secs(10))
        .with_retries(3, Duration::from_millis(500));
    let pool = SessionPool::with_russh(config).unwrap();
    let dispatcher = Dispatcher::new(pool.clone());

    let results = dispatcher
        .run_batch(vec![
            Request::new(endpoint.clone(), Operation::exec("echo hello")),
            Request::new(endpoint.clone(), Operation::exec("exit 4")),
            Request::new(
                endpoint.clone(),
                Operation::execute_file(&script, "/tmp/remote-check.sh"),
            ),
        ])
        .await;
    let after = dispatcher
        .run_batch(vec![Request::new(
            endpoint.clone(),
            Operation::exec("test -e /tmp/remote-check.sh"),
        )])
        .await;

    assert_eq!(results[0].stdout(), Some("hello\n"));
    assert_eq!(results[1].error_kind(), Some(ErrorKind::Execution { exit_code: 4 }));
    assert_eq!(results[2].stdout(), Some("check-ok\n"));
    // The script was removed after running
    assert_eq!(after[0].error_kind(), Some(ErrorKind::Execution { exit_code: 1 }));

    let report = pool.close_all().await;
    assert_eq!(report.closed, 1);
    assert!(report.is_clean());
}
