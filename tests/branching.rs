use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use quarkflow::{CalcRequest, Calculation, Checkout, Formula, GraphError, Ident, Identifier, Resumed};

fn double_of(input: Ident, runs: Arc<AtomicU32>) -> impl Fn() -> Box<dyn Calculation<i64>> {
    move || {
        let runs = Arc::clone(&runs);
        Box::new(Formula::new(
            vec![CalcRequest::Read(input)],
            move |answers: &[Resumed<i64>]| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(answers[0].clone().value().unwrap_or(0) * 2)
            },
        ))
    }
}

#[test]
fn branch_shares_committed_history() {
    let mut trunk = Checkout::new();
    let a = trunk.variable("a", 1);
    trunk.propagate().unwrap();

    let mut branch = trunk.branch();
    assert_eq!(branch.read(a).unwrap(), 1);
}

#[test]
fn writes_after_branching_stay_isolated() {
    let mut trunk = Checkout::new();
    let a = trunk.variable("a", 1);
    trunk.propagate().unwrap();

    let mut branch = trunk.branch();
    branch.write(a, 100).unwrap();
    branch.propagate().unwrap();
    trunk.write(a, 7).unwrap();
    trunk.propagate().unwrap();

    assert_eq!(trunk.read(a).unwrap(), 7);
    assert_eq!(branch.read(a).unwrap(), 100);
}

#[test]
fn identifiers_added_in_a_branch_are_invisible_to_the_trunk() {
    let mut trunk: Checkout<i64> = Checkout::new();
    trunk.propagate().unwrap();

    let mut branch = trunk.branch();
    let fresh = branch.variable("fresh", 5);
    assert_eq!(branch.read(fresh).unwrap(), 5);

    assert!(matches!(
        trunk.read(fresh),
        Err(GraphError::UnknownIdentifier(_))
    ));
}

#[test]
fn removal_in_a_branch_keeps_the_trunk_intact() {
    let mut trunk = Checkout::new();
    let a = trunk.variable("a", 1);
    trunk.propagate().unwrap();

    let mut branch = trunk.branch();
    branch.remove_identifier(a).unwrap();
    branch.propagate().unwrap();

    assert!(matches!(
        branch.read(a),
        Err(GraphError::UnknownIdentifier(_))
    ));
    assert_eq!(trunk.read(a).unwrap(), 1);
}

#[test]
fn removed_identifier_rejects_further_writes() {
    let mut graph = Checkout::new();
    let a = graph.variable("a", 1);
    graph.propagate().unwrap();
    graph.remove_identifier(a).unwrap();

    assert!(matches!(
        graph.write(a, 2),
        Err(GraphError::UnknownIdentifier(_))
    ));
    assert!(matches!(graph.touch(a), Err(GraphError::UnknownIdentifier(_))));
}

#[test]
fn handles_stay_unique_across_the_family() {
    let mut trunk: Checkout<i64> = Checkout::new();
    let a = trunk.variable("a", 1);
    trunk.propagate().unwrap();

    let mut branch = trunk.branch();
    let b = branch.variable("b", 2);
    let c = trunk.variable("c", 3);
    assert_ne!(a, b);
    assert_ne!(b, c);
}

#[test]
fn calculated_values_diverge_with_their_inputs() {
    let mut trunk = Checkout::new();
    let a = trunk.variable("a", 10);
    let runs = Arc::new(AtomicU32::new(0));
    let b = trunk.calculated("b", double_of(a, Arc::clone(&runs)));
    trunk.propagate().unwrap();
    assert_eq!(trunk.read(b).unwrap(), 20);

    let mut branch = trunk.branch();
    branch.write(a, 50).unwrap();
    assert_eq!(branch.read(b).unwrap(), 100);
    // Trunk never saw the branch write, so it never recomputed.
    assert_eq!(trunk.read(b).unwrap(), 20);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn lazy_fill_in_is_shared_between_branches() {
    let mut trunk = Checkout::new();
    let a = trunk.variable("a", 21);
    let runs = Arc::new(AtomicU32::new(0));
    let lazy = trunk.add_identifier(
        Identifier::calculated("lazy", double_of(a, Arc::clone(&runs))).lazy(),
    );
    trunk.propagate().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let mut branch = trunk.branch();
    assert_eq!(branch.read(lazy).unwrap(), 42);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The branch filled the shared revision in place; the trunk reads the
    // same entry without recalculating.
    assert_eq!(trunk.read(lazy).unwrap(), 42);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
