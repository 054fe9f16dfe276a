use arbordb::config::ArborConfig;
use arbordb::machine::command::ProjectionOptions;
use arbordb::term::Term;
use arbordb::ArborInstance;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

const SEEDED_NODES: i64 = 10_000;

async fn setup_store(seed_nodes: i64) -> ArborInstance {
    let store = ArborInstance::open(ArborConfig::default());
    for id in 1..=seed_nodes {
        store
            .put(format!("/stock/item-{id}").as_str(), id)
            .await
            .expect("seed node");
    }
    store
}

fn bench_arbordb_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = rt.block_on(setup_store(SEEDED_NODES));

    let mut next_put_id = 1_i64;
    c.bench_function("hot_put_single_node", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = black_box(next_put_id);
                next_put_id += 1;
                if next_put_id > SEEDED_NODES {
                    next_put_id = 1;
                }
                store
                    .put(format!("/stock/item-{id}").as_str(), id)
                    .await
                    .expect("put");
            });
        })
    });

    let mut next_get_id = 1_i64;
    c.bench_function("point_get_by_path", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = black_box(next_get_id);
                next_get_id += 1;
                if next_get_id > SEEDED_NODES {
                    next_get_id = 1;
                }
                let _ = store
                    .get(format!("/stock/item-{id}").as_str())
                    .await
                    .expect("get");
            });
        })
    });

    c.bench_function("wildcard_count_all_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let count = store.count("/stock/*").await.expect("count");
                black_box(count);
            });
        })
    });

    rt.block_on(async {
        let fun = store
            .registry()
            .register_simple_projection("bench_mirror", |path, value| {
                Ok((Term::from(path.to_string()), value.clone()))
            });
        store
            .register_projection("bench_mirror", "/stock/*", &fun, ProjectionOptions::default())
            .await
            .expect("register projection");
    });

    let mut next_proj_id = 1_i64;
    c.bench_function("put_through_projection", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = black_box(next_proj_id);
                next_proj_id += 1;
                if next_proj_id > SEEDED_NODES {
                    next_proj_id = 1;
                }
                store
                    .put(format!("/stock/item-{id}").as_str(), id + 1)
                    .await
                    .expect("projected put");
            });
        })
    });
}

fn bench_end_to_end_bootstrap(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    c.bench_function("e2e_open_put_get_shutdown", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = setup_store(0).await;
                store.put("/stock/oak", 80).await.expect("put");
                let _ = store.get("/stock/oak").await.expect("get");
                store.shutdown().await;
            });
        })
    });
}

criterion_group!(benches, bench_arbordb_hot_paths, bench_end_to_end_bootstrap);
criterion_main!(benches);
