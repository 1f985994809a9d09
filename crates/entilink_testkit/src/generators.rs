//! Property-based test generators using proptest.
//!
//! Provides strategies for generating property values that fit their
//! declared kinds and entity graphs that exercise the commit planner.

use entilink_codec::{PrimitiveKind, Value};
use entilink_core::CommitMode;
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for display names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 _-]{0,23}").expect("Invalid regex")
}

/// Strategy for values that the JSON codec accepts for `kind`.
pub fn value_strategy(kind: PrimitiveKind) -> BoxedStrategy<Value> {
    match kind {
        PrimitiveKind::Boolean => any::<bool>().prop_map(Value::Bool).boxed(),
        PrimitiveKind::Byte => (0i64..=255).prop_map(Value::Integer).boxed(),
        PrimitiveKind::SByte => (-128i64..=127).prop_map(Value::Integer).boxed(),
        PrimitiveKind::Int16 => any::<i16>().prop_map(|n| Value::Integer(n.into())).boxed(),
        PrimitiveKind::Int32 => any::<i32>().prop_map(|n| Value::Integer(n.into())).boxed(),
        PrimitiveKind::Int64 | PrimitiveKind::Decimal => {
            any::<i64>().prop_map(Value::Integer).boxed()
        }
        PrimitiveKind::Single | PrimitiveKind::Double => {
            (-1.0e6f64..1.0e6).prop_map(Value::Double).boxed()
        }
        PrimitiveKind::Binary => prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(Value::Bytes)
            .boxed(),
        PrimitiveKind::Guid => any::<[u8; 16]>()
            .prop_map(|bytes| Value::Guid(Uuid::from_bytes(bytes)))
            .boxed(),
        PrimitiveKind::Date => (2000u32..2100, 1u32..=12, 1u32..=28)
            .prop_map(|(y, m, d)| Value::Text(format!("{y:04}-{m:02}-{d:02}")))
            .boxed(),
        PrimitiveKind::DateTimeOffset => (0u32..24, 0u32..60)
            .prop_map(|(h, m)| Value::Text(format!("2024-05-01T{h:02}:{m:02}:00Z")))
            .boxed(),
        PrimitiveKind::TimeOfDay => (0u32..24, 0u32..60, 0u32..60)
            .prop_map(|(h, m, s)| Value::Text(format!("{h:02}:{m:02}:{s:02}")))
            .boxed(),
        PrimitiveKind::Duration => (0u32..1000).prop_map(|s| Value::Text(format!("PT{s}S"))).boxed(),
        PrimitiveKind::String => name_strategy().prop_map(Value::Text).boxed(),
    }
}

/// Strategy for a commit mode.
pub fn commit_mode_strategy() -> impl Strategy<Value = CommitMode> {
    prop_oneof![Just(CommitMode::Batched), Just(CommitMode::Sequential)]
}

/// Strategy for a link graph over `1..=max_nodes` nodes.
///
/// Element `i` is the node that node `i` links to, if any. Any node may be
/// chosen, so the graphs include self links and cycles.
pub fn link_graph_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<Option<usize>>> {
    (1..=max_nodes.max(1)).prop_flat_map(|nodes| {
        prop::collection::vec(prop::option::of(0..nodes), nodes)
    })
}

/// Strategy for a link graph whose nodes are partly durable.
///
/// Returns the graph (as [`link_graph_strategy`]) and, per node, whether
/// it is seeded on the service before the session edits it.
pub fn mixed_graph_strategy(
    max_nodes: usize,
) -> impl Strategy<Value = (Vec<Option<usize>>, Vec<bool>)> {
    link_graph_strategy(max_nodes).prop_flat_map(|graph| {
        let nodes = graph.len();
        (Just(graph), prop::collection::vec(any::<bool>(), nodes))
    })
}

/// Strategy for replacing a linked set.
///
/// Returns, per currently linked target, whether it is kept, and the
/// number of new targets to add.
pub fn link_replacement_strategy(
    max_linked: usize,
) -> impl Strategy<Value = (Vec<bool>, usize)> {
    (
        prop::collection::vec(any::<bool>(), 0..=max_linked),
        0usize..3,
    )
}
