use super::*;
use chrono::Duration;

async fn seeded_room(storage: &Storage) -> (RoomId, UserId, UserId, UserId) {
    let room = storage.create_room("saturday-hike").await.expect("room");
    let a = storage
        .create_user("a@x.io", "ana", Some("Ana"))
        .await
        .expect("user a");
    let b = storage
        .create_user("b@x.io", "ben", None)
        .await
        .expect("user b");
    let c = storage
        .create_user("c@x.io", "cho", Some("Cho"))
        .await
        .expect("user c");
    for (user, role) in [(a, RoomRole::Host), (b, RoomRole::Member), (c, RoomRole::Member)] {
        storage
            .ensure_participant(room, user, role)
            .await
            .expect("participant");
    }
    (room, a, b, c)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn create_user_is_an_upsert_on_email() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .create_user("a@x.io", "ana", None)
        .await
        .expect("user");
    let second = storage
        .create_user("a@x.io", "ana", Some("Ana"))
        .await
        .expect("user again");
    assert_eq!(first, second);

    let user = storage
        .user_by_email("a@x.io")
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(user.display_name(), "Ana");
}

#[tokio::test]
async fn display_name_falls_back_to_username_for_blank_nickname() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .create_user("b@x.io", "ben", Some("  "))
        .await
        .expect("user");
    let user = storage.user_by_id(id).await.expect("lookup").expect("present");
    assert_eq!(user.display_name(), "ben");
}

#[tokio::test]
async fn ensure_participant_keeps_existing_watermark() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let at = Utc::now();
    storage.touch_read(room, a, at).await.expect("touch");
    storage
        .ensure_participant(room, a, RoomRole::Member)
        .await
        .expect("re-join");

    let participants = storage.list_participants(room).await.expect("list");
    let ana = participants
        .iter()
        .find(|p| p.user_id == a)
        .expect("ana present");
    assert!(ana.last_read_at.is_some(), "watermark must survive re-join");
    // Role is also untouched by the idempotent upsert.
    assert_eq!(ana.role, RoomRole::Host);
}

#[tokio::test]
async fn touch_read_never_moves_the_watermark_backwards() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let late = Utc::now();
    let earlier = late - Duration::minutes(5);

    storage.touch_read(room, a, late).await.expect("touch");
    storage.touch_read(room, a, earlier).await.expect("stale touch");

    let participants = storage.list_participants(room).await.expect("list");
    let ana = participants.iter().find(|p| p.user_id == a).expect("ana");
    let stored = ana.last_read_at.expect("watermark");
    assert!(stored >= late - Duration::milliseconds(1));
    assert!(stored > earlier);
}

#[tokio::test]
async fn counts_unread_excluding_sender() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, b, _c) = seeded_room(&storage).await;

    let message = storage
        .append_message(room, a, MessageKind::Text, "hi", None)
        .await
        .expect("append");

    // b and c have NULL watermarks; the sender never counts.
    let unread = storage
        .count_others_unread(room, a, message.created_at)
        .await
        .expect("count");
    assert_eq!(unread, 2);

    storage
        .touch_read(room, b, message.created_at)
        .await
        .expect("read");
    let unread = storage
        .count_others_unread(room, a, message.created_at)
        .await
        .expect("count");
    assert_eq!(unread, 1, "watermark at the message timestamp counts as read");
}

#[tokio::test]
async fn append_assigns_strictly_increasing_created_at_per_room() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let mut previous = None;
    for i in 0..20 {
        let message = storage
            .append_message(room, a, MessageKind::Text, &format!("m{i}"), None)
            .await
            .expect("append");
        if let Some(prev) = previous {
            assert!(message.created_at > prev, "created_at must strictly increase");
        }
        previous = Some(message.created_at);
    }
}

#[tokio::test]
async fn recent_messages_are_newest_first_and_bounded() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let message = storage
            .append_message(room, a, MessageKind::Text, &format!("m{i}"), None)
            .await
            .expect("append");
        ids.push(message.message_id);
    }

    let recent = storage.recent_messages(room, 3).await.expect("recent");
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].message_id, ids[4]);
    assert_eq!(recent[2].message_id, ids[2]);
}

#[tokio::test]
async fn history_pages_read_oldest_to_newest() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    for i in 0..5 {
        storage
            .append_message(room, a, MessageKind::Text, &format!("m{i}"), None)
            .await
            .expect("append");
    }

    let newest_page = storage.list_messages_page(room, 0, 2).await.expect("page");
    assert_eq!(newest_page.len(), 2);
    assert_eq!(newest_page[0].content, "m3");
    assert_eq!(newest_page[1].content, "m4");

    let older_page = storage.list_messages_page(room, 1, 2).await.expect("page");
    assert_eq!(older_page[0].content, "m1");
    assert_eq!(older_page[1].content, "m2");
}

#[tokio::test]
async fn metadata_survives_append_and_merge_updates_in_place() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let mut metadata = Metadata::new();
    metadata.insert("totalAmount".into(), serde_json::json!(30000));
    metadata.insert("paidBy".into(), serde_json::json!([]));

    let message = storage
        .append_message(room, a, MessageKind::Bill, "dinner", Some(&metadata))
        .await
        .expect("append");

    let merged = storage
        .update_message_metadata(message.message_id, |current| {
            current.insert("account".into(), serde_json::json!("110-123"));
        })
        .await
        .expect("merge");
    assert_eq!(merged["totalAmount"], serde_json::json!(30000));
    assert_eq!(merged["account"], serde_json::json!("110-123"));

    let stored = storage
        .message_by_id(message.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.metadata.expect("metadata")["account"], serde_json::json!("110-123"));
}

#[tokio::test]
async fn update_metadata_fails_for_missing_message() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .update_message_metadata(MessageId(404), |_| {})
        .await
        .expect_err("should fail");
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn set_unread_count_updates_the_cached_value() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (room, a, ..) = seeded_room(&storage).await;

    let message = storage
        .append_message(room, a, MessageKind::Text, "hi", None)
        .await
        .expect("append");
    storage
        .set_unread_count(message.message_id, 2)
        .await
        .expect("set");

    let stored = storage
        .message_by_id(message.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.unread_count, 2);
}
