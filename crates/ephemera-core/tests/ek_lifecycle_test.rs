//! End-to-end lifecycle scenarios against the simulated server.
//!
//! Each test drives one or more `EkLib` instances through login, keygen,
//! rotation and team key creation, then checks what the server accepted and
//! what each device can read back.

use std::time::Duration;

use ephemera_core::{
    DeviceId, EkConfig, EkError, EkLib, EkStatement, StalenessPolicy, StorageError,
    TeamEkBoxStorage, TeamId, Uid, UserEkBoxStorage,
    publish::prepare_new_user_ek_for_puk, statement::fetch_user_ek_statement,
};
use ephemera_crypto::{
    DhKeyPair, EkSeed, SealedBox, SigningKeyPair, derive_device_key, derive_user_key,
    verify_and_extract,
};
use ephemera_harness::{SIM_EPOCH, SimDevice, SimEnv, SimServer};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn week_policy() -> StalenessPolicy {
    StalenessPolicy::new(7 * DAY)
}

fn device_lib(device: &SimDevice, seed: u64) -> EkLib<SimEnv> {
    EkLib::new(device.context(), SimEnv::with_seed(seed), EkConfig::new(device.server().policy()))
}

fn alice_laptop() -> (SimServer, SimDevice, EkLib<SimEnv>) {
    let server = SimServer::new(week_policy());
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 1);
    (server, device, lib)
}

#[tokio::test]
async fn first_keygen_mints_generation_one_everywhere() {
    let (server, device, lib) = alice_laptop();
    let uid = device.uid().clone();

    lib.keygen_if_needed().await.expect("keygen");

    assert_eq!(server.device_ek_generations(&uid, device.device_id()), vec![1]);
    assert_eq!(server.user_ek_generations(&uid), vec![1]);
    assert_eq!(device.device_storage().generations(), vec![1]);

    let statement = server.current_user_ek_statement(&uid).expect("user statement");
    assert_eq!(statement.current_metadata.generation, 1);
    assert_eq!(statement.current_metadata.ctime, SIM_EPOCH);
    assert!(statement.existing_metadata.is_empty());

    // The wire form spells out an empty list rather than omitting it.
    let sig = server.user_ek_statement(&uid).expect("served statement");
    let (_, payload) = verify_and_extract(&sig).expect("valid signature");
    let json = String::from_utf8(payload).expect("utf8 payload");
    assert!(json.contains("\"existing_metadata\":[]"), "payload was {json}");
}

#[tokio::test]
async fn published_user_ek_is_readable_immediately() {
    let (server, device, lib) = alice_laptop();
    let uid = device.uid().clone();

    lib.keygen_if_needed().await.expect("keygen");

    let ek = device.user_storage().get(1).await.expect("read user ek");
    assert_eq!(derive_user_key(&ek.seed).kid(), ek.metadata.kid);

    let statement = server.current_user_ek_statement(&uid).expect("user statement");
    assert_eq!(statement.current_metadata.kid, ek.metadata.kid);

    // One box, addressed to this device's first device key.
    let boxes = server.user_ek_boxes(&uid, 1);
    assert_eq!(boxes.len(), 1);
    assert_eq!(&boxes[0].recipient_device_id, device.device_id());
    assert_eq!(boxes[0].recipient_generation, 1);
}

#[tokio::test]
async fn keygen_is_idempotent_while_keys_are_fresh() {
    let (server, device, lib) = alice_laptop();
    let uid = device.uid().clone();

    lib.keygen_if_needed().await.expect("first keygen");
    server.advance_time(3 * DAY);
    lib.keygen_if_needed().await.expect("second keygen");
    lib.keygen_if_needed().await.expect("third keygen");

    assert_eq!(server.user_ek_generations(&uid), vec![1]);
    assert_eq!(server.device_ek_generations(&uid, device.device_id()), vec![1]);
    assert!(!lib.new_device_ek_needed().await.expect("device check"));
    assert!(!lib.new_user_ek_needed().await.expect("user check"));
}

#[tokio::test]
async fn rotation_after_interval_advances_generations_and_purges() {
    let (server, device, lib) = alice_laptop();
    let uid = device.uid().clone();

    lib.keygen_if_needed().await.expect("keygen");
    server.advance_time(7 * DAY);
    assert!(lib.new_device_ek_needed().await.expect("device check"));
    assert!(lib.new_user_ek_needed().await.expect("user check"));

    lib.keygen_if_needed().await.expect("rotation");

    assert_eq!(server.user_ek_generations(&uid), vec![1, 2]);
    assert_eq!(server.device_ek_generations(&uid, device.device_id()), vec![1, 2]);

    // Generation 1 is a full lifetime old: purged locally, dropped from
    // the new statement.
    assert_eq!(device.device_storage().generations(), vec![2]);
    assert_eq!(device.user_storage().generations(), vec![2]);
    let statement = server.current_user_ek_statement(&uid).expect("user statement");
    assert!(statement.existing_metadata.is_empty());

    // The new user key is boxed to the new device key.
    let boxes = server.user_ek_boxes(&uid, 2);
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].recipient_generation, 2);
}

#[tokio::test]
async fn early_rotation_carries_active_keys_forward() {
    let policy = week_policy().with_rotation_interval(DAY);
    let server = SimServer::new(policy);
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 2);
    let uid = device.uid().clone();

    lib.keygen_if_needed().await.expect("keygen");
    let first = server.current_user_ek_statement(&uid).expect("gen 1").current_metadata;

    server.advance_time(DAY);
    lib.keygen_if_needed().await.expect("rotation");

    let statement: EkStatement = server.current_user_ek_statement(&uid).expect("gen 2");
    assert_eq!(statement.current_metadata.generation, 2);
    assert_eq!(statement.existing_metadata, vec![first]);

    // Still within its lifetime: generation 1 stays readable.
    let old = device.user_storage().get(1).await.expect("read gen 1");
    assert_eq!(old.metadata, first);
}

#[tokio::test]
async fn device_without_box_for_current_generation_needs_new_user_ek() {
    let (server, laptop, laptop_lib) = alice_laptop();
    let uid = laptop.uid().clone();

    laptop_lib.keygen_if_needed().await.expect("gen 1");
    server.advance_time(7 * DAY);
    laptop_lib.keygen_if_needed().await.expect("gen 2");
    server.advance_time(7 * DAY);
    laptop_lib.keygen_if_needed().await.expect("gen 3");
    assert_eq!(server.user_ek_generations(&uid), vec![1, 2, 3]);

    // A phone provisioned after generation 3 was boxed has nothing to open.
    let phone = server.add_device(&uid, &DeviceId::new("phone"));
    let phone_lib = device_lib(&phone, 3);

    let unreadable = phone.user_storage().get(3).await;
    assert!(matches!(unreadable, Err(StorageError::Unbox(ref e)) if e.generation == 3));
    assert!(phone_lib.new_user_ek_needed().await.expect("user check"));

    phone_lib.keygen_if_needed().await.expect("phone keygen");
    assert_eq!(server.user_ek_generations(&uid), vec![1, 2, 3, 4]);
    assert_eq!(server.device_ek_generations(&uid, phone.device_id()), vec![1]);

    // Generation 3 is still within its lifetime and carried forward, and
    // both devices can read generation 4.
    let statement = server.current_user_ek_statement(&uid).expect("gen 4");
    assert_eq!(statement.existing_metadata.len(), 1);
    assert_eq!(statement.existing_metadata[0].generation, 3);
    assert_eq!(server.user_ek_boxes(&uid, 4).len(), 2);

    let from_phone = phone.user_storage().get(4).await.expect("phone reads gen 4");
    let from_laptop = laptop.user_storage().get(4).await.expect("laptop reads gen 4");
    assert_eq!(from_phone.seed, from_laptop.seed);
}

#[tokio::test]
async fn lost_device_key_makes_user_ek_unreadable() {
    let policy = week_policy().with_rotation_interval(DAY);
    let server = SimServer::new(policy);
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 4);

    lib.keygen_if_needed().await.expect("gen 1");
    server.advance_time(DAY);
    lib.keygen_if_needed().await.expect("gen 2");
    server.advance_time(DAY);
    lib.keygen_if_needed().await.expect("gen 3");

    // Drop the unboxed copy and the device key generation 3 was sealed to.
    lib.on_logout();
    device.device_storage().forget(3);

    assert!(lib.new_user_ek_needed().await.expect("user check"));
}

#[tokio::test]
async fn logged_out_session_is_rejected_before_any_request() {
    let (server, device, lib) = alice_laptop();
    device.set_logged_in(false);

    let keygen = lib.keygen_if_needed().await;
    assert_eq!(keygen, Err(EkError::NotLoggedIn));

    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);
    let team_ek = lib.get_or_create_latest_team_ek(&team).await;
    assert!(matches!(team_ek, Err(EkError::NotLoggedIn)));

    assert_eq!(server.counters().merkle_fetches, 0);
    assert_eq!(server.counters().device_posts, 0);
}

#[tokio::test]
async fn user_without_per_user_key_is_rejected() {
    let server = SimServer::new(week_policy());
    let uid = Uid::new("bob");
    server.add_user_without_puk(&uid);
    let device = server.add_device(&uid, &DeviceId::new("desktop"));
    let lib = device_lib(&device, 5);

    assert_eq!(lib.keygen_if_needed().await, Err(EkError::NoPerUserKey));
    assert_eq!(lib.on_login().await, Err(EkError::NoPerUserKey));
    assert!(server.device_ek_generations(&uid, device.device_id()).is_empty());
}

#[tokio::test]
async fn failed_device_store_write_propagates_after_upload() {
    let (server, device, lib) = alice_laptop();
    device.device_storage().set_fail_puts(true);

    let err = lib.keygen_if_needed().await.expect_err("device put must fail");
    assert!(matches!(err, EkError::Storage(StorageError::Io(_))));
    assert!(err.is_transient());

    // Uploaded, not stored, and no user key attempted after the failure.
    assert_eq!(server.device_ek_generations(device.uid(), device.device_id()), vec![1]);
    assert!(device.device_storage().generations().is_empty());
    assert!(server.user_ek_generations(device.uid()).is_empty());
}

#[tokio::test]
async fn failed_own_box_write_is_not_fatal() {
    let (server, device, lib) = alice_laptop();
    device.user_storage().set_fail_puts(true);

    lib.keygen_if_needed().await.expect("keygen survives own box failure");
    assert_eq!(server.user_ek_generations(device.uid()), vec![1]);
    assert!(device.user_storage().generations().is_empty());

    // The server copy of the box is still readable.
    let ek = device.user_storage().get(1).await.expect("read through server");
    assert_eq!(ek.metadata.generation, 1);
}

#[tokio::test]
async fn box_latest_user_ek_seals_to_new_device() {
    let (_server, device, lib) = alice_laptop();

    let receiver = DhKeyPair::from_secret_bytes([9u8; 32]);
    let boxed = lib
        .box_latest_user_ek(&receiver.public_key(), 1)
        .await
        .expect("box")
        .expect("user ek exists");

    assert_eq!(boxed.recipient_generation, 1);
    assert_eq!(boxed.metadata.generation, 1);

    let sealed = SealedBox::from_hex(&boxed.sealed_box).expect("hex");
    let plaintext = receiver.open(&sealed).expect("open");
    let seed = EkSeed::from_slice(&plaintext).expect("seed");
    assert_eq!(derive_user_key(&seed).kid(), boxed.metadata.kid);

    let mine = device.user_storage().get(1).await.expect("own copy");
    assert_eq!(mine.seed, seed);
}

#[tokio::test]
async fn box_latest_user_ek_without_local_user_ek_is_none() {
    let (_server, device, lib) = alice_laptop();
    device.user_storage().set_fail_puts(true);

    let receiver = DhKeyPair::from_secret_bytes([3u8; 32]);
    let boxed = lib.box_latest_user_ek(&receiver.public_key(), 1).await.expect("box");
    assert!(boxed.is_none());
}

#[tokio::test]
async fn provisioning_helpers_build_a_verifiable_device_statement() {
    let (server, device, lib) = alice_laptop();

    let seed = lib.new_ephemeral_seed();
    let dh = lib.derive_device_dh_key(&seed);
    assert_eq!(dh.kid(), derive_device_key(&seed).kid());

    let signing = SigningKeyPair::from_seed([4u8; 32]);
    let (statement, sig) = lib
        .signed_device_ek_statement_from_seed(1, &seed, &signing, Vec::new())
        .await
        .expect("statement");

    assert_eq!(statement.current_metadata.kid, dh.kid());
    assert_eq!(statement.current_metadata.generation, 1);
    assert_eq!(statement.current_metadata.ctime, server.ctime());

    let (signer, payload) = verify_and_extract(&sig).expect("valid signature");
    assert_eq!(signer, signing.kid());
    let parsed: EkStatement = serde_json::from_slice(&payload).expect("parse");
    assert_eq!(parsed, statement);

    // Nothing was published.
    assert!(server.device_ek_generations(device.uid(), device.device_id()).is_empty());
}

#[tokio::test]
async fn prepare_for_new_puk_builds_without_uploading() {
    let (server, device, lib) = alice_laptop();
    let uid = device.uid().clone();
    lib.keygen_if_needed().await.expect("keygen");

    // The device has seen generation 1 under the old key before the roll.
    let seen = fetch_user_ek_statement(lib.context(), &uid).await.expect("fetch");
    assert!(seen.is_some());

    let new_puk_kid = server.rotate_puk(&uid).expect("rotate");
    let new_puk = server.puk_signing_key(&uid).expect("new puk");
    assert_eq!(new_puk.kid(), new_puk_kid);

    let ctx = lib.context();
    let root = server.fetch_root();
    let env = SimEnv::with_seed(99);
    let prepared = prepare_new_user_ek_for_puk(ctx, &env, &week_policy(), &root, &new_puk)
        .await
        .expect("prepare");

    assert_eq!(prepared.metadata.generation, 2);
    assert_eq!(prepared.boxes.len(), 1);
    assert!(prepared.my_box.is_some());
    let (signer, _) = verify_and_extract(&prepared.sig).expect("valid signature");
    assert_eq!(signer, new_puk_kid);

    assert_eq!(server.user_ek_generations(&uid), vec![1]);

    // Uploading it is accepted as the next generation under the new key.
    server.post_user_ek(&uid, &prepared.sig, &prepared.boxes).expect("upload");
    assert_eq!(server.user_ek_generations(&uid), vec![1, 2]);
}

#[tokio::test]
async fn cleanup_purges_only_expired_keys() {
    let policy = week_policy().with_rotation_interval(2 * DAY);
    let server = SimServer::new(policy);
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 6);

    lib.keygen_if_needed().await.expect("gen 1");
    server.advance_time(2 * DAY);
    lib.keygen_if_needed().await.expect("gen 2");
    assert_eq!(device.device_storage().generations(), vec![1, 2]);

    server.advance_time(5 * DAY);
    lib.cleanup_stale_user_and_device_eks().await.expect("cleanup");

    assert_eq!(device.device_storage().generations(), vec![2]);
    assert_eq!(device.user_storage().generations(), vec![2]);
}

#[tokio::test]
async fn first_team_ek_is_created_and_readable() {
    let (server, device, lib) = alice_laptop();
    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);

    assert!(lib.new_team_ek_needed(&team).await.expect("team check"));

    let ek = lib.get_or_create_latest_team_ek(&team).await.expect("team ek");
    assert_eq!(ek.metadata.generation, 1);
    assert_eq!(server.team_ek_generations(&team), vec![1]);

    // Device and user keys were brought up to date on the way.
    assert_eq!(server.user_ek_generations(device.uid()), vec![1]);

    let stored = device.team_storage().get(&team, 1).await.expect("stored team ek");
    assert_eq!(stored.seed, ek.seed);
    assert!(!lib.new_team_ek_needed(&team).await.expect("team check"));
}

#[tokio::test]
async fn team_members_share_the_same_team_ek() {
    let server = SimServer::new(week_policy());
    let alice = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let bob = server.add_device(&Uid::new("bob"), &DeviceId::new("desktop"));
    let alice_lib = device_lib(&alice, 7);
    let bob_lib = device_lib(&bob, 8);

    let team = TeamId::new("rust");
    server.add_team(&team, &[alice.uid().clone(), bob.uid().clone()]);

    // Bob needs a user key before Alice's team key can be boxed to him.
    bob_lib.keygen_if_needed().await.expect("bob keygen");
    let from_alice = alice_lib.get_or_create_latest_team_ek(&team).await.expect("alice");
    let from_bob = bob_lib.get_or_create_latest_team_ek(&team).await.expect("bob");

    assert_eq!(from_alice.metadata.generation, 1);
    assert_eq!(from_bob.seed, from_alice.seed);
    assert_eq!(server.team_ek_generations(&team), vec![1]);
}

#[tokio::test]
async fn team_ek_rotates_once_the_interval_has_passed() {
    let policy = week_policy().with_rotation_interval(DAY);
    let server = SimServer::new(policy);
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let env = SimEnv::with_seed(9);
    let lib = EkLib::new(device.context(), env.clone(), EkConfig::new(policy));
    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);

    let first = lib.get_or_create_latest_team_ek(&team).await.expect("gen 1");

    server.advance_time(DAY);
    env.advance(DAY);
    let second = lib.get_or_create_latest_team_ek(&team).await.expect("gen 2");

    assert_eq!(second.metadata.generation, 2);
    assert_eq!(server.team_ek_generations(&team), vec![1, 2]);
    let statement = server.current_team_ek_statement(&team).expect("team statement");
    assert_eq!(statement.existing_metadata, vec![first.metadata]);
}

#[tokio::test]
async fn non_member_cannot_create_team_ek() {
    let (server, device, lib) = alice_laptop();
    let team = TeamId::new("closed");
    server.add_team(&team, &[Uid::new("someone-else")]);

    let err = lib.get_or_create_latest_team_ek(&team).await.expect_err("not a member");
    assert!(matches!(err, EkError::Keyring(_)), "got {err:?}");
    assert!(server.team_ek_generations(&team).is_empty());
    assert!(device.team_storage().generations(&team).is_empty());
}

#[tokio::test]
async fn generation_cache_hit_skips_server_round_trips() {
    let server = SimServer::new(week_policy());
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let env = SimEnv::with_seed(10);
    let lib = EkLib::new(device.context(), env.clone(), EkConfig::new(week_policy()));
    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);

    let first = lib.get_or_create_latest_team_ek(&team).await.expect("create");
    let before = server.counters();
    let syncs = device.keyring_syncs();

    let again = lib.get_or_create_latest_team_ek(&team).await.expect("cached");
    assert_eq!(again.seed, first.seed);
    assert_eq!(server.counters(), before);
    assert_eq!(device.keyring_syncs(), syncs);

    // Past the cache TTL the full path runs again.
    env.advance(lib.config().cache_ttl);
    lib.get_or_create_latest_team_ek(&team).await.expect("refetch");
    let after = server.counters();
    assert_eq!(after.merkle_fetches, before.merkle_fetches + 1);
    assert!(after.team_statement_fetches > before.team_statement_fetches);
    assert_eq!(after.team_posts, before.team_posts);
}

#[tokio::test]
async fn purge_only_drops_a_different_generation() {
    let server = SimServer::new(week_policy());
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 11);
    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);

    lib.get_or_create_latest_team_ek(&team).await.expect("create");
    let cached = server.counters();

    lib.purge_team_ek_gen_cache(&team, 1);
    lib.get_or_create_latest_team_ek(&team).await.expect("still cached");
    assert_eq!(server.counters(), cached);

    lib.purge_team_ek_gen_cache(&team, 2);
    lib.get_or_create_latest_team_ek(&team).await.expect("refetch");
    assert_eq!(server.counters().merkle_fetches, cached.merkle_fetches + 1);
}

#[tokio::test]
async fn logout_clears_caches_but_keeps_keys() {
    let server = SimServer::new(week_policy());
    let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
    let lib = device_lib(&device, 12);
    let team = TeamId::new("rust");
    server.add_team(&team, &[device.uid().clone()]);

    lib.get_or_create_latest_team_ek(&team).await.expect("create");
    assert!(device.user_storage().cached_len() > 0);
    assert!(device.team_storage().cached_len() > 0);

    lib.on_logout();

    assert_eq!(device.device_storage().cache_clears(), 1);
    assert_eq!(device.user_storage().cache_clears(), 1);
    assert_eq!(device.team_storage().cache_clears(), 1);
    assert_eq!(device.user_storage().cached_len(), 0);
    assert_eq!(device.team_storage().cached_len(), 0);
    assert_eq!(device.device_storage().generations(), vec![1]);

    // The generation cache went too: the next read takes the full path.
    let before = server.counters();
    let ek = lib.get_or_create_latest_team_ek(&team).await.expect("after logout");
    assert_eq!(ek.metadata.generation, 1);
    assert_eq!(server.counters().merkle_fetches, before.merkle_fetches + 1);
}

#[tokio::test]
async fn fetch_returns_none_before_first_publish() {
    let (_server, device, lib) = alice_laptop();
    let statement = fetch_user_ek_statement(lib.context(), device.uid()).await.expect("fetch");
    assert!(statement.is_none());
}
