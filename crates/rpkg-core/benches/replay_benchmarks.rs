use criterion::{criterion_group, criterion_main, Criterion};
use rpkg_core::Engine;
use rpkg_schema::{PackageInitTaskSpec, PackageTree, RevisionKey, RevisionName};

fn manifests(count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-{i}\ndata:\n  index: \"{i}\"\n"
            )
        })
        .collect::<Vec<_>>()
        .join("---\n")
}

/// A Draft built by an init task and `pushes` successive pushes.
fn populated_engine(pushes: usize) -> (tempfile::TempDir, Engine, RevisionName) {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = engine
        .init(
            &RevisionKey::new("bench", "app", "v1"),
            PackageInitTaskSpec::default(),
        )
        .unwrap();
    let mut version = rev.resource_version;
    let mut tree: PackageTree = engine.pull(&rev.name).unwrap();
    for i in 0..pushes {
        tree.insert(format!("file-{i}.yaml"), manifests(10)).unwrap();
        let pushed = engine.push(&rev.name, &tree, version).unwrap();
        version = pushed.resource_version;
    }
    (store, engine, rev.name)
}

fn bench_init(c: &mut Criterion) {
    c.bench_function("engine_init", |b| {
        b.iter_with_setup(
            || {
                let store = tempfile::tempdir().unwrap();
                let engine = Engine::new(store.path());
                (store, engine)
            },
            |(_store, engine)| {
                engine
                    .init(
                        &RevisionKey::new("bench", "app", "v1"),
                        PackageInitTaskSpec::default(),
                    )
                    .unwrap();
            },
        );
    });
}

fn bench_push(c: &mut Criterion) {
    c.bench_function("engine_push_100_resources", |b| {
        b.iter_with_setup(
            || {
                let (store, engine, name) = populated_engine(0);
                let mut tree = engine.pull(&name).unwrap();
                tree.insert("app.yaml", manifests(100)).unwrap();
                (store, engine, name, tree)
            },
            |(_store, engine, name, tree)| {
                engine.push(&name, &tree, 1).unwrap();
            },
        );
    });
}

fn bench_locked_replay(c: &mut Criterion) {
    c.bench_function("engine_replay_locked", |b| {
        b.iter_with_setup(
            || populated_engine(5),
            |(_store, engine, name)| {
                engine.replay(&name).unwrap();
            },
        );
    });
}

criterion_group!(benches, bench_init, bench_push, bench_locked_replay);
criterion_main!(benches);
