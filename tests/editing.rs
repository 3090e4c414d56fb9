mod support;

use scribefs::protocol::message::Message;
use scribefs::protocol::ops::{Opcode, Status};

use support::{data_request, seed_file, stream_collect, Cluster, EditSession};

async fn read_back(client: &mut support::TestClient, name: &str) -> Vec<u8> {
    let redirect = client.redirect(Opcode::Read, name).await;
    let mut read = Message::request(Opcode::Read);
    read.filename = name.to_string();
    let reply = data_request(&redirect, read, client.username()).await;
    assert_eq!(reply.status, Status::Success, "{}", reply.text());
    reply.data
}

#[tokio::test]
async fn sentence_edit_with_split() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("poem.txt").await;
    seed_file(&cluster.storage_state("ss1"), "poem.txt", b"Hello world").await;

    let (mut session, ack) = EditSession::open(&mut alice, "poem.txt", 0).await;
    assert_eq!(ack.status, Status::Success);
    assert_eq!(ack.text(), "Hello world");
    assert_eq!(ack.word_index, 2);

    let updated = session.insert(2, "there. Again").await;
    assert_eq!(updated.status, Status::Success);
    assert_eq!(updated.text(), "Hello world there.");
    assert_eq!(updated.word_index, 3);

    let committed = session.commit().await;
    assert_eq!(committed.status, Status::Success);
    assert_eq!(committed.text(), "Hello world there. Again\n");

    assert_eq!(read_back(&mut alice, "poem.txt").await, b"Hello world there. Again\n");
}

#[tokio::test]
async fn lock_conflict_names_the_holder() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    let mut bob = cluster.client("bob").await;
    alice.create("poem.txt").await;
    seed_file(&cluster.storage_state("ss1"), "poem.txt", b"Hello world").await;

    // bob can write; the conflict below is about the sentence lock
    let mut grant = Message::request(Opcode::AddAccess);
    grant.filename = "poem.txt".to_string();
    grant.username = "bob".to_string();
    grant.flags = scribefs::protocol::ops::flags::ACCESS_WRITE;
    alice.request(grant).await;

    let (mut alice_session, ack) = EditSession::open(&mut alice, "poem.txt", 0).await;
    assert_eq!(ack.status, Status::Success);

    let (_bob_session, conflict) = EditSession::open(&mut bob, "poem.txt", 0).await;
    assert_eq!(conflict.status, Status::FileLocked);
    assert_eq!(conflict.text(), "alice");
    drop(_bob_session);

    // alice's lock is unaffected by bob's attempt
    let updated = alice_session.insert(2, "still here").await;
    assert_eq!(updated.status, Status::Success);
    assert_eq!(session_commit_text(&mut alice_session).await, "Hello world still here\n");
}

async fn session_commit_text(session: &mut EditSession) -> String {
    let committed = session.commit().await;
    assert_eq!(committed.status, Status::Success, "{}", committed.text());
    committed.text()
}

#[tokio::test]
async fn lock_is_released_when_the_session_ends() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("poem.txt").await;

    {
        let (_session, ack) = EditSession::open(&mut alice, "poem.txt", 0).await;
        assert_eq!(ack.status, Status::Success);
        // dropped without committing: the peer-close path must unlock
    }

    tokio::time::timeout(support::OP_TIMEOUT, async {
        loop {
            if cluster.storage_state("ss1").locks.active_locks("poem.txt") == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("lock survived the session");

    let (mut session, ack) = EditSession::open(&mut alice, "poem.txt", 0).await;
    assert_eq!(ack.status, Status::Success);
    session.insert(0, "Fresh start.").await;
    session.commit().await;
}

#[tokio::test]
async fn one_step_undo() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("poem.txt").await;
    seed_file(&cluster.storage_state("ss1"), "poem.txt", b"Hello world").await;

    let (mut session, _) = EditSession::open(&mut alice, "poem.txt", 0).await;
    session.insert(2, "there. Again").await;
    assert_eq!(session.commit().await.status, Status::Success);

    let redirect = alice.redirect(Opcode::Undo, "poem.txt").await;
    let mut undo = Message::request(Opcode::Undo);
    undo.filename = "poem.txt".to_string();
    let reply = data_request(&redirect, undo.clone(), "alice").await;
    assert_eq!(reply.status, Status::Success, "{}", reply.text());
    assert_eq!(read_back(&mut alice, "poem.txt").await, b"Hello world");

    // a second undo without an intervening write is refused
    let redirect = alice.redirect(Opcode::Undo, "poem.txt").await;
    let reply = data_request(&redirect, undo.clone(), "alice").await;
    assert_eq!(reply.status, Status::InvalidRequest);
    assert!(reply.text().contains("undo"), "message: {}", reply.text());

    // a successful write re-arms undo
    let (mut session, _) = EditSession::open(&mut alice, "poem.txt", 0).await;
    session.insert(2, "anew").await;
    assert_eq!(session.commit().await.status, Status::Success);
    let redirect = alice.redirect(Opcode::Undo, "poem.txt").await;
    let reply = data_request(&redirect, undo, "alice").await;
    assert_eq!(reply.status, Status::Success, "{}", reply.text());
    assert_eq!(read_back(&mut alice, "poem.txt").await, b"Hello world");
}

#[tokio::test]
async fn revert_does_not_rearm_undo() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("poem.txt").await;
    seed_file(&cluster.storage_state("ss1"), "poem.txt", b"Hello world").await;

    let (mut session, _) = EditSession::open(&mut alice, "poem.txt", 0).await;
    session.insert(2, "there.").await;
    assert_eq!(session.commit().await.status, Status::Success);

    let redirect = alice.redirect(Opcode::Undo, "poem.txt").await;
    let mut undo = Message::request(Opcode::Undo);
    undo.filename = "poem.txt".to_string();
    let reply = data_request(&redirect, undo.clone(), "alice").await;
    assert_eq!(reply.status, Status::Success, "{}", reply.text());

    // checkpoint the restored bytes and revert to them; only a committed
    // write may re-arm undo, so the one-step guard must hold through this
    let mut checkpoint = Message::request(Opcode::Checkpoint);
    checkpoint.filename = "poem.txt".to_string();
    checkpoint.checkpoint_tag = "back".to_string();
    assert_eq!(alice.request(checkpoint).await.status, Status::Success);
    let mut revert = Message::request(Opcode::Revert);
    revert.filename = "poem.txt".to_string();
    revert.checkpoint_tag = "back".to_string();
    assert_eq!(alice.request(revert).await.status, Status::Success);

    let redirect = alice.redirect(Opcode::Undo, "poem.txt").await;
    let reply = data_request(&redirect, undo, "alice").await;
    assert_eq!(reply.status, Status::InvalidRequest, "{}", reply.text());
}

#[tokio::test]
async fn sentence_index_validation_over_the_wire() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("draft.txt").await;
    seed_file(&cluster.storage_state("ss1"), "draft.txt", b"One. Two").await;

    // past the append slot: the bound is the sentence count
    let (_s, reply) = EditSession::open(&mut alice, "draft.txt", 5).await;
    assert_eq!(reply.status, Status::SentenceOutOfRange);
    assert_eq!(reply.word_index, 2);

    // the append slot itself needs a terminated predecessor
    let (_s, reply) = EditSession::open(&mut alice, "draft.txt", 2).await;
    assert_eq!(reply.status, Status::SentenceOutOfRange);
    assert_eq!(reply.word_index, 1);

    // sentence 1 is editable even though it is unterminated
    let (mut session, reply) = EditSession::open(&mut alice, "draft.txt", 1).await;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.text(), "Two");
    session.insert(1, "more.").await;
    assert_eq!(session.commit().await.text(), "One. Two more.\n");

    // now the append slot opens up
    let (mut session, reply) = EditSession::open(&mut alice, "draft.txt", 2).await;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.text(), "");
    session.insert(0, "Three.").await;
    assert_eq!(session.commit().await.text(), "One. Two more. Three.\n");
}

#[tokio::test]
async fn word_range_errors_do_not_end_the_session() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("draft.txt").await;
    seed_file(&cluster.storage_state("ss1"), "draft.txt", b"Hello world").await;

    let (mut session, _) = EditSession::open(&mut alice, "draft.txt", 0).await;
    let reply = session.insert(7, "nope").await;
    assert_eq!(reply.status, Status::WordOutOfRange);
    assert_eq!(reply.word_index, 2);

    // the session is still live
    let reply = session.insert(2, "indeed").await;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.text(), "Hello world indeed");
    assert_eq!(session.commit().await.status, Status::Success);
}

#[tokio::test]
async fn empty_file_materialises_sentence_zero() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("blank.txt").await;

    let (_s, reply) = EditSession::open(&mut alice, "blank.txt", 1).await;
    assert_eq!(reply.status, Status::SentenceOutOfRange);

    let (mut session, reply) = EditSession::open(&mut alice, "blank.txt", 0).await;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.text(), "");
    assert_eq!(reply.word_index, 0);
    session.insert(0, "From nothing.").await;
    assert_eq!(session.commit().await.text(), "From nothing.\n");
}

#[tokio::test]
async fn stream_emits_words_and_line_markers() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("song.txt").await;
    seed_file(&cluster.storage_state("ss1"), "song.txt", b"alpha beta\ngamma").await;

    let redirect = alice.redirect(Opcode::Stream, "song.txt").await;
    let frames = stream_collect(&redirect, "song.txt", "alice").await;
    assert_eq!(frames, vec!["alpha", "beta", "\n", "gamma"]);
}

#[tokio::test]
async fn stream_of_an_empty_file_is_just_the_stop_packet() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("void.txt").await;

    let redirect = alice.redirect(Opcode::Stream, "void.txt").await;
    let frames = stream_collect(&redirect, "void.txt", "alice").await;
    assert!(frames.is_empty());
}

#[tokio::test]
async fn commits_are_visible_to_the_next_read() {
    let cluster = Cluster::start().await;
    let mut alice = cluster.client("alice").await;
    alice.create("notes.txt").await;

    let (mut session, _) = EditSession::open(&mut alice, "notes.txt", 0).await;
    session.insert(0, "Durable words.").await;
    let committed = session.commit().await;
    assert_eq!(committed.status, Status::Success);

    assert_eq!(read_back(&mut alice, "notes.txt").await, b"Durable words.\n");
}
