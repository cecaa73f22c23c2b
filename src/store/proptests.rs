//! Property-based tests for the active-conversation pointer

use super::*;
use crate::kv::MemoryKv;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create,
    /// Select the nth conversation, modulo length
    Select(usize),
    SelectUnknown,
    Delete(usize),
    Rename(usize),
    Append,
    Clear,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Create),
        2 => any::<usize>().prop_map(Op::Select),
        1 => Just(Op::SelectUnknown),
        2 => any::<usize>().prop_map(Op::Delete),
        1 => any::<usize>().prop_map(Op::Rename),
        1 => Just(Op::Append),
        1 => Just(Op::Clear),
    ]
}

fn nth_id(store: &ConversationStore, n: usize) -> Option<String> {
    let conversations = store.conversations().unwrap();
    if conversations.is_empty() {
        None
    } else {
        Some(conversations[n % conversations.len()].id.clone())
    }
}

fn apply(store: &ConversationStore, op: &Op) {
    match op {
        Op::Create => {
            store.create_conversation().unwrap();
        }
        Op::Select(n) => {
            if let Some(id) = nth_id(store, *n) {
                store.select_conversation(&id).unwrap();
            }
        }
        Op::SelectUnknown => {
            store.select_conversation("does-not-exist").unwrap();
        }
        Op::Delete(n) => {
            if let Some(id) = nth_id(store, *n) {
                store.delete_conversation(&id).unwrap();
            }
        }
        Op::Rename(n) => {
            if let Some(id) = nth_id(store, *n) {
                store.rename_conversation(&id, "renamed").unwrap();
            }
        }
        Op::Append => {
            store.append_message(Message::user("x")).unwrap();
        }
        Op::Clear => store.clear_all().unwrap(),
    }
}

fn assert_pointer_valid(store: &ConversationStore) {
    let conversations = store.conversations().unwrap();
    match store.active_id().unwrap() {
        None => {}
        Some(id) => assert!(
            conversations.iter().any(|c| c.id == id),
            "active id {id} not in registry"
        ),
    }
}

proptest! {
    #[test]
    fn prop_active_pointer_always_valid(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        for op in &ops {
            apply(&store, op);
            assert_pointer_valid(&store);
        }
    }

    #[test]
    fn prop_deleting_inactive_never_moves_pointer(
        setup in proptest::collection::vec(arb_op(), 0..20),
        pick in any::<usize>(),
    ) {
        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        for op in &setup {
            apply(&store, op);
        }
        let active = store.active_id().unwrap();
        let inactive: Vec<String> = store
            .conversations()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .filter(|id| Some(id) != active.as_ref())
            .collect();
        prop_assume!(!inactive.is_empty());

        store.delete_conversation(&inactive[pick % inactive.len()]).unwrap();
        prop_assert_eq!(store.active_id().unwrap(), active);
    }

    #[test]
    fn prop_deleting_active_picks_first_remaining(
        setup in proptest::collection::vec(arb_op(), 0..20),
    ) {
        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        for op in &setup {
            apply(&store, op);
        }
        let Some(active) = store.active_id().unwrap() else {
            return Ok(());
        };

        store.delete_conversation(&active).unwrap();
        let expected = store.conversations().unwrap().first().map(|c| c.id.clone());
        prop_assert_eq!(store.active_id().unwrap(), expected);
    }

    #[test]
    fn prop_reload_reproduces_registry(ops in proptest::collection::vec(arb_op(), 0..30)) {
        let kv = Arc::new(MemoryKv::new());
        let store = ConversationStore::load(kv.clone());
        for op in &ops {
            apply(&store, op);
        }

        let reloaded = ConversationStore::load(kv);
        prop_assert_eq!(reloaded.conversations().unwrap(), store.conversations().unwrap());
        prop_assert_eq!(reloaded.active_id().unwrap(), store.active_id().unwrap());
    }
}
