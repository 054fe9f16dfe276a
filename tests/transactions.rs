use arbordb::config::ArborConfig;
use arbordb::error::ArborError;
use arbordb::sproc::{StandaloneFun, TxAccess};
use arbordb::term::Term;
use arbordb::tx::{abort, TxMode};
use arbordb::ArborInstance;

fn store() -> ArborInstance {
    ArborInstance::open(ArborConfig::development())
}

#[tokio::test]
async fn read_write_transaction_moves_stock_atomically() {
    let store = store();
    store.put("/stock/oak", 80).await.expect("seed");
    store.put("/reserved/oak", 0).await.expect("seed");

    let fun = store
        .registry()
        .register_tx("reserve_oak", TxAccess::ReadWrite, |tx| {
            let (_, stock) = tx.get("/stock/oak")?;
            let (_, reserved) = tx.get("/reserved/oak")?;
            let available = stock.data().and_then(Term::as_int).unwrap_or(0);
            if available < 10 {
                return Err(abort("insufficient stock"));
            }
            let held = reserved.data().and_then(Term::as_int).unwrap_or(0);
            tx.put("/stock/oak", available - 10)?;
            tx.put("/reserved/oak", held + 10)?;
            Ok(Term::from(available - 10))
        });

    let remaining = store
        .transaction(&fun, TxMode::ReadWrite)
        .await
        .expect("transaction");
    assert_eq!(remaining, Term::from(70));
    assert_eq!(
        store.get_or("/stock/oak", -1).await.expect("stock"),
        Term::from(70)
    );
    assert_eq!(
        store.get_or("/reserved/oak", -1).await.expect("reserved"),
        Term::from(10)
    );
}

#[tokio::test]
async fn aborted_transactions_roll_back_their_writes() {
    let store = store();
    store.put("/stock/oak", 5).await.expect("seed");

    let fun = store
        .registry()
        .register_tx("overdraw", TxAccess::ReadWrite, |tx| {
            tx.put("/stock/oak", 0)?;
            Err(abort("insufficient stock"))
        });

    let err = store
        .transaction(&fun, TxMode::ReadWrite)
        .await
        .expect_err("abort");
    assert!(matches!(
        err,
        ArborError::Abort { ref reason } if reason == &Term::from("insufficient stock")
    ));
    // The write inside the aborted transaction is invisible.
    assert_eq!(
        store.get_or("/stock/oak", -1).await.expect("stock"),
        Term::from(5)
    );
}

#[tokio::test]
async fn read_only_transactions_deny_mutations() {
    let store = store();
    store.put("/stock/oak", 80).await.expect("seed");

    let fun = store
        .registry()
        .register_tx("sneaky_write", TxAccess::ReadOnly, |tx| {
            tx.put("/stock/oak", 0)?;
            Ok(Term::Unit)
        });
    let err = store
        .transaction(&fun, TxMode::ReadOnly)
        .await
        .expect_err("denied");
    assert!(matches!(err, ArborError::StoreUpdateDenied { .. }));
    assert_eq!(
        store.get_or("/stock/oak", -1).await.expect("stock"),
        Term::from(80)
    );
}

#[tokio::test]
async fn read_only_closures_observe_a_snapshot() {
    let store = store();
    store.put("/stock/oak", 80).await.expect("seed");
    store.put("/stock/pine", 30).await.expect("seed");

    let total = store
        .transaction_ro(|tx| {
            let stock = tx.get_many("/stock/*")?;
            let sum: i64 = stock
                .values()
                .filter_map(|props| props.data().and_then(Term::as_int))
                .sum();
            Ok(Term::from(sum))
        })
        .await
        .expect("read-only transaction");
    assert_eq!(total, Term::from(110));
}

#[tokio::test]
async fn auto_mode_resolves_the_declared_access_class() {
    let store = store();
    store.put("/counter", 0).await.expect("seed");

    let rw = store
        .registry()
        .register_tx("bump", TxAccess::ReadWrite, |tx| {
            let current = tx.get("/counter")?.1.data().and_then(Term::as_int).unwrap_or(0);
            tx.put("/counter", current + 1)?;
            Ok(Term::from(current + 1))
        });
    let value = store.transaction(&rw, TxMode::Auto).await.expect("auto rw");
    assert_eq!(value, Term::from(1));
    assert_eq!(
        store.get_or("/counter", -1).await.expect("counter"),
        Term::from(1)
    );

    let ro = store
        .registry()
        .register_tx("peek", TxAccess::ReadOnly, |tx| {
            Ok(tx.get("/counter")?.1.data.unwrap_or(Term::Unit))
        });
    let value = store.transaction(&ro, TxMode::Auto).await.expect("auto ro");
    assert_eq!(value, Term::from(1));
}

#[tokio::test]
async fn auto_mode_refuses_unregistered_functions() {
    let store = store();
    let unknown = StandaloneFun::new("not_registered", 0);
    let err = store
        .transaction(&unknown, TxMode::Auto)
        .await
        .expect_err("unanalyzable");
    assert!(matches!(
        err,
        ArborError::UnanalyzableTxFun { ref name } if name == "not_registered"
    ));
}

#[tokio::test]
async fn panics_surface_as_exceptions_and_roll_back() {
    let store = store();
    store.put("/stock/oak", 80).await.expect("seed");

    let fun = store
        .registry()
        .register_tx("explode", TxAccess::ReadWrite, |tx| {
            tx.put("/stock/oak", 0)?;
            panic!("boom");
        });
    let err = store
        .transaction(&fun, TxMode::ReadWrite)
        .await
        .expect_err("exception");
    match err {
        ArborError::Exception { kind, value, .. } => {
            assert_eq!(kind, "panic");
            assert_eq!(value, Term::from("boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        store.get_or("/stock/oak", -1).await.expect("stock"),
        Term::from(80)
    );
}

#[tokio::test]
async fn transactions_serialize_with_other_commands() {
    let store = store();
    store.put("/counter", 0).await.expect("seed");
    let fun = store
        .registry()
        .register_tx("inc", TxAccess::ReadWrite, |tx| {
            let current = tx.get("/counter")?.1.data().and_then(Term::as_int).unwrap_or(0);
            tx.put("/counter", current + 1)?;
            Ok(Term::from(current + 1))
        });

    for _ in 0..10 {
        store.transaction(&fun, TxMode::ReadWrite).await.expect("inc");
    }
    assert_eq!(
        store.get_or("/counter", -1).await.expect("counter"),
        Term::from(10)
    );
}
