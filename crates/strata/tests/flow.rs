//! End-to-end flow scenarios
//!
//! Each test builds documents from YAML text, runs the engine to its fixed
//! point and compares the result structurally (annotations ignored, list
//! order significant, map order not).

use pretty_assertions::assert_eq;
use strata::{document, flow, flow_with, Features, Node, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STRATA_LOG"))
        .with_writer(std::io::stderr)
        .try_init();
}

fn assert_equivalent(result: &Node, expected_yaml: &str) {
    let expected = document!(expected_yaml);
    assert!(
        result.equivalent(&expected),
        "expected:\n{}\ngot:\n{}",
        serde_yaml::to_string(&expected).unwrap(),
        serde_yaml::to_string(result).unwrap()
    );
}

#[test]
fn basic_override() {
    init_tracing();
    let source = document!("source" => "a: x\nb: y\n");
    let stub = document!("stub" => "a: X\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "a: X\nb: y\n");
}

#[test]
fn expression_evaluation() {
    init_tracing();
    let source = document!("a: 1\nb: (( a + 2 ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "a: 1\nb: 3\n");
}

#[test]
fn nested_references_and_arithmetic() {
    init_tracing();
    let source = document!(
        "numbers:\n  six: 6\nproducts:\n  square: (( numbers.six * numbers.six ))\n  half: (( numbers.six / 2 ))\n"
    );
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(
        &result,
        "numbers:\n  six: 6\nproducts:\n  square: 36\n  half: 3\n",
    );
}

#[test]
fn merge_with_list_identity_marker_first() {
    init_tracing();
    let source = document!(
        "source" =>
        "items:\n- <<: (( merge ))\n- name: n1\n  v: 1\n"
    );
    let stub = document!(
        "stub" =>
        "items:\n- name: n1\n  v: 9\n- name: n2\n  v: 2\n"
    );
    let result = flow(&source, &[stub]).unwrap();
    // stub-new entries splice in at the marker position
    assert_equivalent(
        &result,
        "items:\n- name: n2\n  v: 2\n- name: n1\n  v: 9\n",
    );
}

#[test]
fn merge_with_list_identity_marker_last() {
    init_tracing();
    let source = document!(
        "source" =>
        "items:\n- name: n1\n  v: 1\n- <<: (( merge ))\n"
    );
    let stub = document!(
        "stub" =>
        "items:\n- name: n1\n  v: 9\n- name: n2\n  v: 2\n"
    );
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(
        &result,
        "items:\n- name: n1\n  v: 9\n- name: n2\n  v: 2\n",
    );
}

#[test]
fn list_identity_key_rename() {
    init_tracing();
    let source = document!(
        "source" =>
        "items:\n- key:id: s1\n  v: 1\n- <<: (( merge ))\n"
    );
    let stub = document!(
        "stub" =>
        "items:\n- id: s1\n  v: 9\n- id: s2\n  v: 2\n"
    );
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(
        &result,
        "items:\n- id: s1\n  v: 9\n- id: s2\n  v: 2\n",
    );
}

#[test]
fn template_substitution_with_temporary_cleanup() {
    init_tracing();
    let source = document!(
        "t:\n  <<: (( &template &temporary ))\n  x: (( a ))\nu: (( *t { a = 7 } ))\n"
    );
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "u:\n  x: 7\n");
}

#[test]
fn for_control_over_list() {
    init_tracing();
    let source = document!("list:\n  for:\n    i:\n    - 1\n    - 2\n    - 3\n  do: (( i * i ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "list:\n- 1\n- 4\n- 9\n");
}

#[test]
fn for_control_over_map_values() {
    init_tracing();
    let source = document!("m:\n  for:\n    k:\n      x: 1\n      y: 2\n  do: (( k ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "m:\n- 1\n- 2\n");
}

#[test]
fn for_control_with_mapkey() {
    init_tracing();
    let source = document!(
        "m:\n  for:\n    k:\n    - a\n    - b\n  do: (( index-k ))\n  mapkey: (( k ))\n"
    );
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "m:\n  a: 0\n  b: 1\n");
}

#[test]
fn for_control_list_form_iterates_last_variable_fastest() {
    init_tracing();
    let source = document!(
        "pairs:\n  for:\n  - name: x\n    values:\n    - a\n    - b\n  - name: y\n    values:\n    - 1\n    - 2\n  do: (( join(\"-\", [x, y]) ))\n"
    );
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "pairs:\n- a-1\n- a-2\n- b-1\n- b-2\n");
}

#[test]
fn for_control_with_map_body() {
    init_tracing();
    let source = document!("objs:\n  for:\n    i:\n    - 1\n    - 2\n  do:\n    sq: (( i * i ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "objs:\n- sq: 1\n- sq: 4\n");
}

#[test]
fn for_control_over_empty_range() {
    init_tracing();
    let source = document!("e:\n  for:\n    i: []\n  do: (( i ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "e: []\n");
}

#[test]
fn for_control_rejects_regular_fields() {
    init_tracing();
    let source = document!("e:\n  for:\n    i:\n    - 1\n  do: (( i ))\n  bogus: 1\n");
    let err = flow(&source, &[]).unwrap_err();
    assert!(err
        .to_string()
        .contains("no regular fields allowed in for control"));
}

#[test]
fn tag_conflict_reports_and_keeps_partial_output() {
    init_tracing();
    let source = document!("a: (( &tag:*x (1) ))\nb: (( &tag:*x (2) ))\n");
    let err = flow(&source, &[]).unwrap_err();
    assert_eq!(err.issues.len(), 1);
    assert_eq!(err.issues[0].path, vec!["b".to_string()]);
    assert!(err.to_string().contains("duplicate tag 'x'"));

    // both values evaluated, the conflicting one is annotated
    let map = err.node.value().as_object().unwrap();
    assert_eq!(map.get("a").unwrap().value(), &Value::Integer(1));
    assert_eq!(map.get("b").unwrap().value(), &Value::Integer(2));
}

#[test]
fn tag_published_nodes_are_referencable() {
    init_tracing();
    let source = document!("a: (( &tag:*common (42) ))\nb: (( common ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "a: 42\nb: 42\n");
}

#[test]
fn merge_without_stub_backing_is_optional() {
    init_tracing();
    let source = document!("<<: (( merge ))\na: 1\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "a: 1\n");
}

#[test]
fn merge_seeds_stub_only_keys() {
    init_tracing();
    let source = document!("source" => "cfg:\n  <<: (( merge ))\n  x: 1\n");
    let stub = document!("stub" => "cfg:\n  x: 9\n  y: 7\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "cfg:\n  x: 9\n  y: 7\n");
}

#[test]
fn merge_with_explicit_path_redirects_lookups() {
    init_tracing();
    let source = document!("source" => "cfg:\n  <<: (( merge props ))\n  x: 1\n");
    let stub = document!("stub" => "props:\n  x: 9\n  y: 7\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "cfg:\n  x: 9\n  y: 7\n");
}

#[test]
fn merge_replace_takes_the_stub_value_wholesale() {
    init_tracing();
    let source = document!("source" => "cfg:\n  <<: (( merge replace ))\n  x: 1\n");
    let stub = document!("stub" => "cfg:\n  y: 2\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "cfg:\n  y: 2\n");
}

#[test]
fn alternatives_fall_back_when_no_stub_provides_a_value() {
    init_tracing();
    let source = document!("source" => "a: (( merge || 5 ))\nb: (( merge || 6 ))\n");
    let stub = document!("stub" => "b: 60\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "a: 5\nb: 60\n");
}

#[test]
fn undefined_values_are_dropped_from_containers() {
    init_tracing();
    let source = document!("a: (( ~~ ))\nb: 1\nlist:\n- (( ~~ ))\n- 2\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "b: 1\nlist:\n- 2\n");
}

#[test]
fn temporary_values_resolve_before_cleanup() {
    init_tracing();
    let source = document!("tmp: (( &temporary (6) ))\nval: (( tmp * 7 ))\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "val: 42\n");
}

#[test]
fn stub_injection_adds_flagged_entries() {
    init_tracing();
    // flow the stub on its own first so its markers become flags
    let stub_source = document!("stub" => "a: 9\nextra: (( &inject (5) ))\n");
    let stub = flow(&stub_source, &[]).unwrap();

    let source = document!("source" => "a: 1\nb: 2\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "a: 9\nb: 2\nextra: 5\n");
}

#[test]
fn default_flagged_stub_values_do_not_override() {
    init_tracing();
    let stub_source = document!("stub" => "a: (( &default (9) ))\nb: (( &default (8) ))\n");
    let stub = flow(&stub_source, &[]).unwrap();

    let source = document!("source" => "a: 1\n");
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "a: 1\n");
}

#[test]
fn interpolation_concatenates_literals_and_expressions() {
    init_tracing();
    let source = document!("name: app\ngreeting: hello-(( name ))!\n");
    let result = flow_with(Features { interpolation: true }, &source, &[]).unwrap();
    assert_equivalent(&result, "name: app\ngreeting: hello-app!\n");
}

#[test]
fn interpolation_is_off_by_default() {
    init_tracing();
    let source = document!("name: app\ngreeting: hello-(( name ))!\n");
    let result = flow(&source, &[]).unwrap();
    assert_equivalent(&result, "name: app\ngreeting: hello-(( name ))!\n");
}

#[test]
fn dynamic_marker_on_plain_value_is_an_error() {
    init_tracing();
    let source = document!("a: (( &dynamic (5) ))\n");
    let err = flow(&source, &[]).unwrap_err();
    assert!(err
        .to_string()
        .contains("dynamic marker for non-template value node"));
}

#[test]
fn parse_failures_keep_the_scalar_and_report() {
    init_tracing();
    let source = document!("a: (( 1 + ))\nb: 2\n");
    let err = flow(&source, &[]).unwrap_err();
    assert_eq!(err.issues.len(), 1);
    assert_eq!(err.issues[0].path, vec!["a".to_string()]);
    assert!(err.to_string().contains("failed to parse expression"));

    let map = err.node.value().as_object().unwrap();
    assert_eq!(map.get("a").unwrap().value().as_str(), Some("(( 1 + ))"));
}

#[test]
fn unresolved_references_surface_as_aggregate_error() {
    init_tracing();
    let source = document!("a: (( nowhere ))\nb: (( also.nowhere ))\n");
    let err = flow(&source, &[]).unwrap_err();
    assert_eq!(err.issues.len(), 2);
    assert!(err.to_string().contains("not found"));
}

#[test]
fn flow_is_deterministic() {
    init_tracing();
    let yaml = "z: (( a + 1 ))\na: 1\nm:\n  k: (( z ))\n";
    let first = flow(&document!(yaml), &[]).unwrap();
    let second = flow(&document!(yaml), &[]).unwrap();
    assert_eq!(first, second);
}

#[test]
fn fully_resolved_flows_are_idempotent() {
    init_tracing();
    let source = document!(
        "source" =>
        "items:\n- <<: (( merge ))\n- name: n1\n  v: (( 1 + 0 ))\nplain: (( 2 * 3 ))\n"
    );
    let stub = document!(
        "stub" =>
        "items:\n- name: n1\n  v: 9\n- name: n2\n  v: 2\n"
    );
    let once = flow(&source, &[stub.clone()]).unwrap();
    let twice = flow(&once, &[stub]).unwrap();
    assert!(
        once.equivalent(&twice),
        "re-flowing a resolved document changed it:\n{}\nvs\n{}",
        serde_yaml::to_string(&once).unwrap(),
        serde_yaml::to_string(&twice).unwrap()
    );
}

#[test]
fn stub_precedence_for_unprotected_leaves() {
    init_tracing();
    let source = document!(
        "source" =>
        "top:\n  inner:\n    a: 1\n    b: 2\n  c: 3\n"
    );
    let stub = document!(
        "stub" =>
        "top:\n  inner:\n    a: 10\n  c: 30\n"
    );
    let result = flow(&source, &[stub]).unwrap();
    assert_equivalent(&result, "top:\n  inner:\n    a: 10\n    b: 2\n  c: 30\n");
}

#[test]
fn first_stub_wins() {
    init_tracing();
    let source = document!("source" => "a: 1\n");
    let first = document!("first" => "a: 2\n");
    let second = document!("second" => "a: 3\n");
    let result = flow(&source, &[first, second]).unwrap();
    assert_equivalent(&result, "a: 2\n");
}

#[test]
fn nested_flows_share_the_outer_tag_registry() {
    init_tracing();
    let env = strata::Binding::new(Vec::new(), "outer", Features::default());

    let first = document!("first" => "a: (( &tag:*shared (7) ))\n");
    strata::nested_flow(Some(&env), &first, &[]).unwrap();

    let second = document!("second" => "b: (( shared ))\n");
    let result = strata::nested_flow(Some(&env), &second, &[]).unwrap();
    assert_equivalent(&result, "b: 7\n");
}

#[test]
fn flow_sources_convenience() {
    init_tracing();
    let result = strata::flow_sources("a: (( 1 + 1 ))\nb: y\n", &["b: Y\n"]).unwrap();
    assert_equivalent(&result, "a: 2\nb: Y\n");
}
