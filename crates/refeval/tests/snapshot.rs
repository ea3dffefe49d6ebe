//! Snapshot tests
//!
//! Loads each *.yaml manifest in /tests/ individually and compares if the
//! resolved `test` attribute of its root resource changes.

#[test]
fn snapshots() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("REFEVAL_LOG"))
        .with_writer(std::io::stderr)
        .init();

    insta::glob!("*.yaml", |path| {
        let mut tree = refeval::ResourceTree::new();
        let root = tree.load_file(path).expect("must be a valid manifest");

        let test = tree
            .attributes(root)
            .get("test")
            .expect("valid value")
            .expect("root must have a `test` attribute");
        let rendered = tree.materialize(&test).expect("valid value");

        insta::assert_yaml_snapshot!(rendered);
    });
}
