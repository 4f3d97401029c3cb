//! Property-based tests for the probe compiler
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Struct layouts respect natural alignment for any member list
//! 2. `strcmp` orders strings like a byte-wise comparison, in both operand orders
//! 3. The compiler never panics on arbitrary operator trees, and whatever it
//!    accepts passes verification

mod common;

use common::{compile, le64, run};
use probec::{Field, Node, Probe, Type, TypeRef, TypeRegistry};
use proptest::prelude::*;

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

fn scalar() -> impl Strategy<Value = TypeRef> {
    prop::sample::select(vec!["char", "u8", "s16", "u16", "int", "u32", "s64", "u64"])
        .prop_map(|name| Type::scalar(name).expect("built-in scalar"))
}

fn member() -> impl Strategy<Value = TypeRef> {
    prop_oneof![
        4 => scalar(),
        1 => (scalar(), 1usize..5).prop_map(|(t, n)| Type::array_of(t, n)),
        1 => Just(Type::pointer_to(Type::void())),
    ]
}

fn leaf() -> impl Strategy<Value = Node> {
    prop_oneof![
        prop::sample::select(vec!["m", "n", "comm", "p", "x"]).prop_map(Node::ident),
        (-3i64..600).prop_map(Node::num),
        "[a-z]{0,4}".prop_map(Node::string),
    ]
}

fn tree() -> impl Strategy<Value = Node> {
    leaf().prop_recursive(4, 24, 3, |inner| {
        (
            prop::sample::select(vec![
                ".", "->", "u*", ":struct", "[]", "=", "delete", "strcmp", "mem", "str",
                "frob",
            ]),
            prop::collection::vec(inner, 0..4),
        )
            .prop_map(|(func, args)| Node::expr(func, args))
    })
}

fn fuzz_probe(stmt: Node) -> Probe {
    let pair = Type::struct_of(
        "pair",
        vec![
            Field::new("a", Type::int()),
            Field::new("b", Type::char()),
        ],
    );
    let mut p = Probe::new("fuzz");
    p.declare_context("comm", Type::array_of(Type::char(), 16), 0)
        .expect("declare");
    p.declare_context("p", Type::pointer_to(pair), 16)
        .expect("declare");
    p.declare_context("x", Type::u64(), 24).expect("declare");
    p.push(stmt);
    p
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn struct_members_are_naturally_aligned(members in prop::collection::vec(member(), 1..8)) {
        let types = TypeRegistry::new();
        let ty = types.anon_struct(members.clone());
        let sou = ty.as_struct().expect("struct");
        let offsets = sou.offsets();

        let mut end = 0;
        for (off, m) in offsets.iter().zip(&members) {
            prop_assert!(*off >= end, "members overlap");
            prop_assert_eq!(off % m.align(), 0);
            end = off + m.size();
        }
        prop_assert!(ty.size() >= end);
        prop_assert_eq!(ty.size() % ty.align(), 0);
        prop_assert_eq!(types.anon_struct(members), ty.clone());
    }

    #[test]
    fn field_order_is_declaration_order(names in prop::collection::hash_set("[a-z]{1,6}", 1..6)) {
        let names: Vec<String> = names.into_iter().collect();
        let ty = Type::struct_of(
            "t",
            names.iter().map(|n| Field::new(n.clone(), Type::u64())).collect(),
        );
        for (i, n) in names.iter().enumerate() {
            prop_assert_eq!(ty.offset_of(n), Some(i * 8));
        }
    }

    #[test]
    fn strcmp_matches_bytewise_order(a in "[a-c]{0,7}", b in "[a-c]{0,7}") {
        let mut p = Probe::new("strcmp");
        p.declare_context("a", Type::array_of(Type::char(), 8), 0).expect("declare");
        p.declare_context("b", Type::array_of(Type::char(), 8), 8).expect("declare");
        let call = |x: &str, y: &str| Node::expr("strcmp", vec![Node::ident(x), Node::ident(y)]);
        p.push(Node::assign(Node::subscript(Node::ident("r"), Node::num(0)), call("a", "b")));
        p.push(Node::assign(Node::subscript(Node::ident("r"), Node::num(1)), call("b", "a")));

        let mut ctx = vec![0u8; 16];
        ctx[..a.len()].copy_from_slice(a.as_bytes());
        ctx[8..8 + b.len()].copy_from_slice(b.as_bytes());
        let (out, vm) = run(p, ctx);

        let r = vm.map("r", &out);
        let get = |k: u64| {
            let v = r.get(&le64(k)).expect("stored");
            i32::from_le_bytes([v[0], v[1], v[2], v[3]])
        };
        let (fwd, rev) = (get(0), get(1));
        prop_assert_eq!(fwd, -rev);
        prop_assert_eq!(fwd.cmp(&0), a.as_bytes().cmp(b.as_bytes()));
        prop_assert_eq!(fwd == 0, a == b);
    }

    #[test]
    fn strcmp_against_literal_matches_bytewise_order(s in "[a-c]{0,7}", lit in "[a-c]{0,7}") {
        let mut p = Probe::new("strcmp_lit");
        p.declare_context("s", Type::array_of(Type::char(), 8), 0).expect("declare");
        p.push(Node::assign(
            Node::subscript(Node::ident("r"), Node::num(0)),
            Node::expr("strcmp", vec![Node::ident("s"), Node::string(lit.clone())]),
        ));
        p.push(Node::assign(
            Node::subscript(Node::ident("r"), Node::num(1)),
            Node::expr("strcmp", vec![Node::string(lit.clone()), Node::ident("s")]),
        ));

        let mut ctx = vec![0u8; 8];
        ctx[..s.len()].copy_from_slice(s.as_bytes());
        let (out, vm) = run(p, ctx);

        let r = vm.map("r", &out);
        let get = |k: u64| {
            let v = r.get(&le64(k)).expect("stored");
            i32::from_le_bytes([v[0], v[1], v[2], v[3]])
        };
        prop_assert_eq!(get(0), -get(1));
        prop_assert_eq!(get(0).cmp(&0), s.as_bytes().cmp(lit.as_bytes()));
    }

    #[test]
    fn map_store_keeps_any_value(key in any::<i64>(), value in any::<i64>()) {
        let mut p = Probe::new("store");
        p.push(Node::assign(
            Node::subscript(Node::ident("m"), Node::num(key)),
            Node::num(value),
        ));
        let (out, vm) = run(p, vec![]);
        let expected = le64(value as u64);
        prop_assert_eq!(
            vm.map("m", &out).get(&le64(key as u64)),
            Some(expected.as_slice())
        );
    }

    #[test]
    fn compiler_never_panics(stmt in tree()) {
        match compile(fuzz_probe(stmt)) {
            Ok(out) => {
                prop_assert!(out.verification.valid);
                prop_assert_eq!(
                    out.bytecode.len(),
                    out.program.iter().map(|i| i.size()).sum::<usize>()
                );
                prop_assert!(out.stack_size <= 512);
            }
            Err(e) => prop_assert!(!e.to_string().is_empty()),
        }
    }
}
