//! Property tests for the inbound line parser.

use canopy_mesh::protocol::{parse_line, Response};
use proptest::prelude::*;

proptest! {
    /// The parser must survive arbitrary line noise.
    #[test]
    fn never_panics(line in ".*") {
        let _ = parse_line(&line);
    }

    /// Every well-formed response line classifies to its type with the node
    /// id intact, for both separator styles.
    #[test]
    fn valid_grammar_classifies(
        ty in prop::sample::select(vec!["ACK", "STATUS", "TIMEOUT", "PEND", "ERR"]),
        node in 0u32..10_000,
        result in proptest::option::of(0u32..256),
        sep in prop::sample::select(vec![" ", "-"]),
        prefix in "[a-z]{0,8}",
    ) {
        let mut line = format!("{prefix}###{ty}{sep}{node}");
        if let Some(result) = result {
            line.push_str(&format!("{sep}{result}"));
        }
        match (ty, parse_line(&line)) {
            ("ACK", Response::Ack { node: n, code }) => {
                prop_assert_eq!(n, node);
                prop_assert_eq!(code, result.unwrap_or(0));
            }
            ("STATUS", Response::Status { node: n, value }) => {
                prop_assert_eq!(n, node);
                prop_assert_eq!(value, result.unwrap_or(0));
            }
            ("TIMEOUT", Response::Timeout { node: n }) => prop_assert_eq!(n, node),
            ("PEND", Response::Pend { node: n }) => prop_assert_eq!(n, node),
            ("ERR", Response::Err { node: n }) => prop_assert_eq!(n, node),
            (_, other) => prop_assert!(false, "unexpected parse: {other:?}"),
        }
    }

    /// Lines without the marker or the prompt token stay inert.
    #[test]
    fn plain_noise_is_other(noise in "[a-z0-9 ]{0,40}") {
        prop_assert!(matches!(parse_line(&noise), Response::Other(_)));
    }
}
