use super::*;

#[test]
fn test_local_set_get() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "answer", 42i32);
    assert_eq!(bbs.get::<i32>(ROOT_SCOPE, "answer"), Some(&42));
    assert_eq!(bbs.get::<i32>(ROOT_SCOPE, "missing"), None);
}

#[test]
fn test_type_mismatch() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "answer", 42i32);
    assert!(matches!(
        bbs.get_checked::<String>(ROOT_SCOPE, "answer"),
        Err(TickError::TypeMismatch { .. })
    ));
    assert_eq!(bbs.get::<String>(ROOT_SCOPE, "answer"), None);
}

#[test]
fn test_child_does_not_see_parent_without_remap() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "secret", 1u8);
    let child = bbs.create_child(ROOT_SCOPE, "sub");
    assert!(!bbs.contains(child, "secret"));
}

#[test]
fn test_remapped_read_and_write() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "target", 1i32);
    let child = bbs.create_child(ROOT_SCOPE, "sub");
    bbs.add_remap(child, "goal", "target");

    assert_eq!(bbs.get::<i32>(child, "goal"), Some(&1));
    let info = bbs.entry_info(child, "goal").unwrap();
    assert!(info.remapped);

    bbs.set(child, "goal", 2i32);
    assert_eq!(bbs.get::<i32>(ROOT_SCOPE, "target"), Some(&2));
    assert!(bbs.local_keys(child).is_empty());
}

#[test]
fn test_writes_do_not_propagate_upward() {
    let mut bbs = Blackboards::new();
    let child = bbs.create_child(ROOT_SCOPE, "sub");
    bbs.set(child, "local", true);
    assert!(!bbs.contains(ROOT_SCOPE, "local"));
    assert_eq!(bbs.get::<bool>(child, "local"), Some(&true));
}

#[test]
fn test_autoremap_skips_private_keys() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "shared", 3u32);
    bbs.set(ROOT_SCOPE, "_private", 4u32);
    let child = bbs.create_child(ROOT_SCOPE, "sub");
    bbs.set_autoremap(child, true);

    assert_eq!(bbs.get::<u32>(child, "shared"), Some(&3));
    assert_eq!(bbs.get::<u32>(child, "_private"), None);

    bbs.set(child, "shared", 5u32);
    assert_eq!(bbs.get::<u32>(ROOT_SCOPE, "shared"), Some(&5));
}

#[test]
fn test_remap_chain_through_two_scopes() {
    let mut bbs = Blackboards::new();
    bbs.set(ROOT_SCOPE, "pose", "home".to_string());
    let mid = bbs.create_child(ROOT_SCOPE, "mid");
    bbs.add_remap(mid, "target", "pose");
    let leaf = bbs.create_child(mid, "leaf");
    bbs.add_remap(leaf, "goal", "target");

    assert_eq!(
        bbs.get::<String>(leaf, "goal").map(String::as_str),
        Some("home")
    );
    bbs.set(leaf, "goal", "dock".to_string());
    assert_eq!(
        bbs.get::<String>(ROOT_SCOPE, "pose").map(String::as_str),
        Some("dock")
    );
}
