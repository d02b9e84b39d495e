//! Integration tests for conversations over the reference engine.
//!
//! Validates:
//! - Chunked streaming: chunk boundaries, stop tokens, limits, the terminal sentinel
//! - Failure turns end with an error chunk followed by exactly one `[DONE]`
//! - Interaction persistence offsets and replay
//! - Checkpoint/restore round trips and atomic restore failure

use std::path::Path;

use kvsession_engine::{InferenceEngine, TokenId};
use kvsession_runtime::*;
use kvsession_store::{CacheSnapshot, SnapshotStore, StoreError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn letters(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| b as TokenId + 3).collect()
}

fn engine() -> ReferenceEngine {
    ReferenceEngine::new(ReferenceConfig {
        max_seq_len: 256,
        ..Default::default()
    })
}

fn config(root: &Path) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_sessions_root(root)
        .with_prompt_limit(64)
        .with_response_limit(64)
}

fn context(root: &Path, engine: ReferenceEngine) -> ConversationContext<ReferenceEngine> {
    ConversationContext::new(engine, config(root)).unwrap()
}

/// Keys and values of every occupied position, all layers.
fn occupied_rows<E: InferenceEngine>(engine: &E) -> Vec<f32> {
    let mem = engine.memory();
    let mut out = Vec::new();
    for l in 0..mem.n_layers() {
        let layer = mem.layer(l).unwrap();
        for pos in 0..mem.seq_len() {
            out.extend_from_slice(layer.key_at(0, pos));
            out.extend_from_slice(layer.value_at(0, pos));
        }
    }
    out
}

fn assert_single_done_at_end(chunks: &[StreamChunk]) {
    assert_eq!(chunks.last(), Some(&StreamChunk::Done));
    assert_eq!(chunks.iter().filter(|c| c.is_done()).count(), 1);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[test]
fn ten_tokens_stream_as_four_four_two_then_done() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("abcdefghij")));

    let chunks: Vec<StreamChunk> = ctx.generate("hi").collect();
    assert_eq!(
        chunks,
        vec![
            StreamChunk::Text("abcd".into()),
            StreamChunk::Text("efgh".into()),
            StreamChunk::Text("ij".into()),
            StreamChunk::Done,
        ]
    );

    let report = ctx.last_report().unwrap();
    assert_eq!(report.generated_tokens, 11);
    assert_eq!(report.prompt_tokens, 4);
}

#[test]
fn stop_token_joins_the_sequence_but_not_the_text() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("ok")));

    let text: String = ctx
        .generate("hi")
        .filter(|c| !c.is_done())
        .map(|c| c.text().to_string())
        .collect();
    assert_eq!(text, "ok");

    // [BOS h i EOS] + [o k EOS]
    assert_eq!(ctx.tokens().len(), 7);
    assert_eq!(ctx.tokens().last(), Some(&REFERENCE_EOS));
    assert_eq!(ctx.occupied_length(), 7);
}

#[test]
fn configured_stop_ids_end_the_turn() {
    let root = tempfile::tempdir().unwrap();
    let mut script = letters("ab");
    script.push(151643);
    script.extend(letters("zz"));
    script.push(REFERENCE_BOS);
    let mut ctx = context(root.path(), engine().with_script(script));

    let first: Vec<StreamChunk> = ctx.generate("one").collect();
    assert_eq!(first, vec![StreamChunk::Text("ab".into()), StreamChunk::Done]);

    let second: Vec<StreamChunk> = ctx.generate("two").collect();
    assert_eq!(second, vec![StreamChunk::Text("zz".into()), StreamChunk::Done]);
}

#[test]
fn response_limit_caps_generation() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path()).with_response_limit(5);
    let mut ctx =
        ConversationContext::new(engine().with_script(letters("abcdefghij")), config).unwrap();

    let chunks: Vec<StreamChunk> = ctx.generate("hi").collect();
    assert_eq!(
        chunks,
        vec![
            StreamChunk::Text("abcd".into()),
            StreamChunk::Text("e".into()),
            StreamChunk::Done,
        ]
    );
    assert_eq!(ctx.last_report().unwrap().generated_tokens, 5);
}

#[test]
fn only_first_turn_gets_bos() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script([]));

    let mut first = ctx.generate("a");
    first.by_ref().for_each(drop);
    assert_eq!(first.prompt_ids(), &[REFERENCE_BOS, 100, REFERENCE_EOS]);
    drop(first);

    let mut second = ctx.generate("b");
    second.by_ref().for_each(drop);
    assert_eq!(second.prompt_ids(), &[101, REFERENCE_EOS]);
}

#[test]
fn offsets_cover_prompt_and_response() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("xyz")));

    ctx.generate("hello").for_each(drop);
    let report = ctx.last_report().unwrap().clone();
    assert_eq!(report.start_offset, 0);
    // BOS + 5 bytes + EOS, then x y z EOS
    assert_eq!(report.end_offset, 7 + 4);
    assert_eq!(report.end_offset, ctx.occupied_length());
}

#[test]
fn empty_prompt_yields_error_then_done() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine());

    let mut stream = ctx.generate("   ");
    let chunks: Vec<StreamChunk> = stream.by_ref().collect();
    assert_eq!(
        chunks,
        vec![StreamChunk::Error("empty prompt".into()), StreamChunk::Done]
    );
    assert!(stream.next().is_none());
    drop(stream);
    assert!(ctx.tokens().is_empty());
}

#[test]
fn engine_not_ready_yields_error_then_done() {
    let root = tempfile::tempdir().unwrap();
    let mut engine = engine();
    engine.set_ready(false);
    let mut ctx = context(root.path(), engine);

    let chunks: Vec<StreamChunk> = ctx.generate("hi").collect();
    assert_eq!(
        chunks,
        vec![StreamChunk::Error("engine not ready".into()), StreamChunk::Done]
    );
}

#[test]
fn oversized_prompt_is_rejected_without_feeding() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine());

    let chunks: Vec<StreamChunk> = ctx.generate(&"x".repeat(100)).collect();
    assert!(chunks[0].is_error());
    assert!(chunks[0].text().contains("limit is 64"));
    assert_single_done_at_end(&chunks);
    assert_eq!(ctx.occupied_length(), 0);
}

#[test]
fn exhausted_context_surfaces_as_error_chunk() {
    let root = tempfile::tempdir().unwrap();
    let small = ReferenceEngine::new(ReferenceConfig {
        max_seq_len: 24,
        ..Default::default()
    })
    .with_script(letters("abcdefghijklmnopqrstuvwxyz"));
    let config = config(root.path())
        .with_prompt_limit(8)
        .with_response_limit(16)
        .with_chunk_size(8);
    let mut ctx = ConversationContext::new(small, config).unwrap();

    let first: Vec<StreamChunk> = ctx.generate("hi").collect();
    assert!(first.iter().all(|c| !c.is_error()));
    assert_eq!(ctx.occupied_length(), 20);

    let second: Vec<StreamChunk> = ctx.generate("more").collect();
    assert!(second[0].is_error());
    assert!(second[0].text().contains("context exhausted"));
    assert_single_done_at_end(&second);
    assert_eq!(ctx.occupied_length(), 20);
}

#[test]
fn dropping_a_stream_finishes_the_turn() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("abcdefghij")));

    let mut stream = ctx.generate("hi");
    assert_eq!(stream.next(), Some(StreamChunk::Text("abcd".into())));
    drop(stream);

    assert_eq!(ctx.tokens().len(), 4 + 11);
    assert_eq!(ctx.occupied_length(), ctx.tokens().len());
    assert_eq!(ctx.last_report().unwrap().generated_tokens, 11);
}

#[test]
fn chunks_render_as_sse() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("hey")));

    let frames: Vec<String> = ctx.generate("hi").map(|c| c.to_sse()).collect();
    assert_eq!(
        frames,
        vec![
            "data: {\"text\":\"hey\"}\n\n".to_string(),
            "data: {\"text\":\"[DONE]\"}\n\n".to_string(),
        ]
    );
}

#[test]
fn unscripted_generation_always_terminates() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine());

    for prompt in ["hello", "tell me more", "and again"] {
        let chunks: Vec<StreamChunk> = ctx.generate(prompt).collect();
        assert_single_done_at_end(&chunks);
        assert!(chunks.iter().all(|c| !c.is_error()));
    }
    assert_eq!(ctx.occupied_length(), ctx.tokens().len());
}

#[test]
fn telemetry_hook_receives_report() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("abc")));
    let log = LogTelemetry::new();

    ctx.generate_with("hi", Box::new(log.clone())).for_each(drop);
    let report = log.last_report().unwrap();
    assert_eq!(report.generated_tokens, 4);
    assert_eq!(Some(&report), ctx.last_report());
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

#[test]
fn interactions_record_offsets_and_replay() {
    let root = tempfile::tempdir().unwrap();
    let mut script = letters("ab");
    script.push(REFERENCE_EOS);
    script.extend(letters("c"));
    let mut ctx = context(root.path(), engine().with_script(script));
    let dir = ctx.connect("alice", true).unwrap();

    let mut first = ctx.generate("hi");
    first.by_ref().for_each(drop);
    assert!(first.interaction_path().unwrap().starts_with(&dir));
    drop(first);
    ctx.generate("yo").for_each(drop);

    let turns = SnapshotStore::load_all_interactions(&dir).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!((turns[0].start_offset, turns[0].end_offset), (0, 7));
    assert_eq!((turns[1].start_offset, turns[1].end_offset), (7, 12));
    assert_eq!(turns[1].prompt_ids, [letters("yo"), vec![REFERENCE_EOS]].concat());
    assert_eq!(turns[1].response_ids, vec![102, REFERENCE_EOS]);

    let mut fresh = context(root.path(), engine());
    assert_eq!(fresh.replay_interactions(&dir).unwrap(), 2);
    assert_eq!(fresh.tokens(), ctx.tokens());
    assert_eq!(occupied_rows(fresh.engine()), occupied_rows(ctx.engine()));
}

#[test]
fn interactions_off_by_default() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters("a")));
    let dir = ctx.connect("alice", false).unwrap();

    ctx.generate("hi").for_each(drop);
    assert!(SnapshotStore::load_all_interactions(&dir).unwrap().is_empty());

    ctx.set_save_interactions(true);
    ctx.generate("again").for_each(drop);
    assert_eq!(SnapshotStore::load_all_interactions(&dir).unwrap().len(), 1);
}

#[test]
fn replay_refuses_history_larger_than_memory() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine().with_script(letters(&"a".repeat(40))));
    let dir = ctx.connect("alice", true).unwrap();
    ctx.generate("hi").for_each(drop);

    let tiny = ReferenceEngine::new(ReferenceConfig {
        max_seq_len: 32,
        ..Default::default()
    });
    let config = config(root.path())
        .with_prompt_limit(8)
        .with_response_limit(8);
    let mut small = ConversationContext::new(tiny, config).unwrap();
    assert!(matches!(
        small.replay_interactions(&dir),
        Err(SessionError::Engine(_))
    ));
    assert!(small.tokens().is_empty());
}

// ---------------------------------------------------------------------------
// Checkpoint / restore
// ---------------------------------------------------------------------------

#[test]
fn checkpoint_restore_is_identical_and_resumes_deterministically() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine());
    ctx.connect("alice", false).unwrap();
    ctx.generate("first question").for_each(drop);
    let path = ctx.checkpoint().unwrap();

    let mut resumed = context(root.path(), engine());
    resumed.restore(&path).unwrap();
    assert_eq!(resumed.tokens(), ctx.tokens());
    assert_eq!(resumed.occupied_length(), ctx.occupied_length());
    assert_eq!(occupied_rows(resumed.engine()), occupied_rows(ctx.engine()));

    let a: Vec<StreamChunk> = ctx.generate("follow up").collect();
    let b: Vec<StreamChunk> = resumed.generate("follow up").collect();
    assert_eq!(a, b);
}

#[test]
fn restore_missing_snapshot_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(root.path(), engine());
    let err = ctx.restore(&root.path().join("absent.snapshot")).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Store(StoreError::SnapshotNotFound(_))
    ));
}

#[test]
fn restore_shape_mismatch_leaves_state_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("wide.snapshot");
    let mut wide = ReferenceEngine::new(ReferenceConfig {
        n_heads: 4,
        max_seq_len: 256,
        ..Default::default()
    });
    wide.feed(&[1, 10, 11]).unwrap();
    let snap = CacheSnapshot::capture(&[1, 10, 11], wide.memory()).unwrap();
    SnapshotStore::save(&snap, &path).unwrap();

    let mut ctx = context(root.path(), engine().with_script(letters("q")));
    ctx.generate("keep me").for_each(drop);
    let tokens = ctx.tokens().to_vec();
    let rows = occupied_rows(ctx.engine());

    assert!(matches!(
        ctx.restore(&path),
        Err(SessionError::RestoreFailed(_))
    ));
    assert_eq!(ctx.tokens(), tokens.as_slice());
    assert_eq!(occupied_rows(ctx.engine()), rows);
}

#[test]
fn restore_corrupt_snapshot_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("bad.snapshot");
    std::fs::write(&path, b"\x08\0\0\0\0\0\0\0not json").unwrap();

    let mut ctx = context(root.path(), engine());
    assert!(matches!(
        ctx.restore(&path),
        Err(SessionError::Store(StoreError::SnapshotCorrupt { .. }))
    ));
}

#[test]
fn restore_of_partially_advanced_snapshot_catches_up_on_next_turn() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("partial.snapshot");

    // Memory holds three positions; the token sequence records five.
    let mut donor = engine();
    donor.feed(&[1, 10, 11]).unwrap();
    let mut snap = CacheSnapshot::capture(&[1, 10, 11], donor.memory()).unwrap();
    snap.token_sequence.extend([12, 13]);
    SnapshotStore::save(&snap, &path).unwrap();

    let mut ctx = context(root.path(), engine().with_script(letters("z")));
    ctx.restore(&path).unwrap();
    assert_eq!(ctx.occupied_length(), 3);
    assert_eq!(ctx.tokens().len(), 5);

    ctx.generate("go").for_each(drop);
    assert_eq!(ctx.occupied_length(), ctx.tokens().len());

    let mut full = engine();
    full.feed(ctx.tokens()).unwrap();
    assert_eq!(occupied_rows(&full), occupied_rows(ctx.engine()));
}
