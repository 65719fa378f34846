mod common;

use agentdb::{DbOptions, VectorRecord};
use common::TestDb;

#[test]
fn zz_debug() {
    let db = TestDb::new(8);
    db.insert(VectorRecord::new(vec![0.0; 8])).unwrap();
    let path = db.path();
    drop(db);

    let err = agentdb::Db::open(DbOptions::new(16).with_path(path)).unwrap_err();
    eprintln!("ERR = {err:?}");
}
