//! Properties of template synthesis that hold for whole topologies.

use camino::Utf8Path;
use rstest::{fixture, rstest};
use topogen::test_support::sample_topology;
use topogen::{
    DeploymentScope, Resource, ResourceKind, SynthesisError, Synthesizer, Topology,
    TopologyError, VirtualFileTree, parse_manifest,
};

const NAMESPACE_DECLARATION: &str = "'Microsoft.ServiceBus/namespaces@";
const QUEUE_DECLARATION: &str = "'Microsoft.ServiceBus/namespaces/queues@";

#[fixture]
fn synthesizer() -> Synthesizer {
    Synthesizer::new().unwrap_or_else(|err| panic!("templates should load: {err}"))
}

fn scope() -> DeploymentScope {
    DeploymentScope::new("dev", "eastus")
}

fn synthesize(synthesizer: &Synthesizer, topology: &Topology) -> VirtualFileTree {
    synthesizer
        .synthesize(topology, &scope())
        .unwrap_or_else(|err| panic!("synthesis should succeed: {err}"))
}

fn resources_template(tree: &VirtualFileTree) -> &str {
    tree.text(Utf8Path::new("infra/resources.bicep"))
        .unwrap_or_else(|| panic!("shared resource template should be generated"))
}

fn manifest(resources: &str) -> Topology {
    parse_manifest(&format!(r#"{{ "resources": {{ {resources} }} }}"#))
        .unwrap_or_else(|err| panic!("manifest should parse: {err}"))
}

#[rstest]
fn synthesis_is_deterministic(synthesizer: Synthesizer) {
    let topology = sample_topology();

    let first = synthesize(&synthesizer, &topology);
    let second = synthesize(&synthesizer, &topology);

    assert_eq!(first, second);
}

#[rstest]
fn synthesis_ignores_declaration_order(synthesizer: Synthesizer) {
    let forward: Vec<Resource> = sample_topology().resources().cloned().collect();
    let mut reversed = forward.clone();
    reversed.reverse();
    let mut rotated = forward.clone();
    rotated.rotate_left(2);

    let expected = synthesize(
        &synthesizer,
        &Topology::new(forward).unwrap_or_else(|err| panic!("forward: {err}")),
    );
    for resources in [reversed, rotated] {
        let topology = Topology::new(resources).unwrap_or_else(|err| panic!("permuted: {err}"));
        assert_eq!(synthesize(&synthesizer, &topology), expected);
    }
}

#[rstest]
fn topology_without_queues_emits_no_queue_block(synthesizer: Synthesizer) {
    let topology = manifest(
        r#""web": { "type": "project", "bindings": { "http": { "targetPort": 8080 } } },
           "orders": { "type": "postgres" }"#,
    );

    let tree = synthesize(&synthesizer, &topology);

    assert!(!resources_template(&tree).contains("Microsoft.ServiceBus"));
}

#[rstest]
fn one_queue_namespace_declares_each_queue_once(synthesizer: Synthesizer) {
    let topology = manifest(
        r#""web": { "type": "project", "bindings": { "http": { "targetPort": 8080 } } },
           "messaging": { "type": "service-bus", "queues": ["orders", "emails"] }"#,
    );

    let tree = synthesize(&synthesizer, &topology);
    let resources = resources_template(&tree);

    assert_eq!(resources.matches(NAMESPACE_DECLARATION).count(), 1);
    assert_eq!(resources.matches(QUEUE_DECLARATION).count(), 2);
}

#[rstest]
fn colliding_names_fail_instead_of_overwriting(synthesizer: Synthesizer) {
    let topology = Topology::new([
        Resource::new("My-Service", ResourceKind::Project),
        Resource::new("my_service", ResourceKind::Project),
    ])
    .unwrap_or_else(|err| panic!("distinct names should be accepted: {err}"));

    let err = synthesizer
        .synthesize(&topology, &scope())
        .expect_err("collision should fail");

    let SynthesisError::IdentifierCollision { first, second, .. } = err else {
        panic!("expected identifier collision, got {err}");
    };
    assert_eq!((first.as_str(), second.as_str()), ("My-Service", "my_service"));
}

#[test]
fn dangling_reference_is_rejected_at_construction() {
    let err = Topology::new([Resource::new("api", ResourceKind::Project)
        .with_env("ConnectionStrings__orders", "{orders.connectionString}")])
    .expect_err("missing datastore should be rejected");

    let TopologyError::DanglingReference { missing, .. } = err else {
        panic!("expected dangling reference, got {err}");
    };
    assert_eq!(missing, "orders");
}

#[rstest]
fn resource_token_changes_generated_names(synthesizer: Synthesizer) {
    let topology = sample_topology();

    let dev = synthesize(&synthesizer, &topology);
    let prod = synthesizer
        .synthesize(&topology, &DeploymentScope::new("prod", "eastus"))
        .unwrap_or_else(|err| panic!("synthesis should succeed: {err}"));

    assert_ne!(resources_template(&dev), resources_template(&prod));
    assert_eq!(
        dev.paths().collect::<Vec<_>>(),
        prod.paths().collect::<Vec<_>>()
    );
}
