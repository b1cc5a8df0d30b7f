use super::*;

/// Env vars are process-global, so every case runs inside one test
#[test]
fn test_env_configuration() {
    std::env::remove_var("KUBEREPLAY_LEADER_ELECTION");
    assert!(!is_leader_election_enabled());
    std::env::set_var("KUBEREPLAY_LEADER_ELECTION", "true");
    assert!(is_leader_election_enabled());
    std::env::set_var("KUBEREPLAY_LEADER_ELECTION", "1");
    assert!(is_leader_election_enabled());
    std::env::set_var("KUBEREPLAY_LEADER_ELECTION", "yes");
    assert!(!is_leader_election_enabled());
    std::env::remove_var("KUBEREPLAY_LEADER_ELECTION");

    std::env::remove_var("KUBEREPLAY_RESYNC_SECONDS");
    assert_eq!(resync_interval(), Duration::from_secs(DEFAULT_RESYNC_SECONDS));
    std::env::set_var("KUBEREPLAY_RESYNC_SECONDS", "120");
    assert_eq!(resync_interval(), Duration::from_secs(120));
    std::env::set_var("KUBEREPLAY_RESYNC_SECONDS", "0");
    assert_eq!(resync_interval(), Duration::from_secs(DEFAULT_RESYNC_SECONDS));
    std::env::set_var("KUBEREPLAY_RESYNC_SECONDS", "soon");
    assert_eq!(resync_interval(), Duration::from_secs(DEFAULT_RESYNC_SECONDS));
    std::env::remove_var("KUBEREPLAY_RESYNC_SECONDS");
}
