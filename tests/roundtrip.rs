use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use skill_rt::{
    restrictions::NonNull, Chunk, FieldType, FieldValue, ReadMode, SkillError, SkillFile,
};
use tempfile::TempDir;

fn path_in(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn empty_state_roundtrips_byte_identical() {
    let dir = TempDir::new().unwrap();
    let a = path_in(&dir, "a.sf");
    let b = path_in(&dir, "b.sf");

    let mut sf = SkillFile::create();
    sf.write(&a).unwrap();

    let mut sf = SkillFile::open(&a, ReadMode::Eager).unwrap();
    assert_eq!(sf.pools().len(), 0);
    assert_eq!(sf.strings().len(), 0);
    sf.write(&b).unwrap();
    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn single_i32_field_roundtrip() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "p.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let x = sf.add_field(p, "x", FieldType::I32).unwrap();
    let a = sf.make(p).unwrap();
    let b = sf.make(p).unwrap();
    sf.set(p, x, &a, FieldValue::I32(7)).unwrap();
    sf.set(p, x, &b, FieldValue::I32(-1)).unwrap();
    sf.write(&file).unwrap();
    assert_eq!(a.skill_id(), 1);
    assert_eq!(b.skill_id(), 2);

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let x = sf.pools()[p].field("x").unwrap();
    assert_eq!(sf.size(p), 2);
    assert_eq!(sf.static_size(p), 2);
    let first = sf.get_by_id(p, 1).unwrap();
    let second = sf.get_by_id(p, 2).unwrap();
    assert_eq!(sf.get(p, x, &first).unwrap(), FieldValue::I32(7));
    assert_eq!(sf.get(p, x, &second).unwrap(), FieldValue::I32(-1));
    assert!(sf.get_by_id(p, 3).is_none());

    // two i32 values occupy exactly eight payload bytes
    let chunk = &sf.pools()[p].declaration(x).unwrap().chunks()[0];
    assert_eq!(chunk.end() - chunk.begin(), 8);
}

#[test]
fn rereading_and_rewriting_is_byte_stable() {
    let dir = TempDir::new().unwrap();
    let a = path_in(&dir, "a.sf");
    let b = path_in(&dir, "b.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("node", None).unwrap();
    let label = sf.add_field(p, "label", FieldType::Str).unwrap();
    let weight = sf.add_field(p, "weight", FieldType::V64).unwrap();
    for i in 0..20i64 {
        let o = sf.make(p).unwrap();
        sf.set(p, label, &o, FieldValue::Str(Arc::from(format!("n{i}").as_str())))
            .unwrap();
        sf.set(p, weight, &o, FieldValue::I64(i * 1000)).unwrap();
    }
    sf.write(&a).unwrap();

    let mut sf = SkillFile::open(&a, ReadMode::Eager).unwrap();
    sf.write(&b).unwrap();
    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn strings_are_deduplicated_and_interned() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "s.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let s = sf.add_field(p, "s", FieldType::Str).unwrap();
    let a = sf.make(p).unwrap();
    let b = sf.make(p).unwrap();
    sf.set(p, s, &a, FieldValue::Str(Arc::from("abc"))).unwrap();
    sf.set(p, s, &b, FieldValue::Str(Arc::from("abc"))).unwrap();
    sf.write(&file).unwrap();

    let bytes = fs::read(&file).unwrap();
    assert_eq!(count_occurrences(&bytes, b"abc"), 1);

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let s = sf.pools()[p].field("s").unwrap();
    let va = sf.get(p, s, &sf.get_by_id(p, 1).unwrap()).unwrap();
    let vb = sf.get(p, s, &sf.get_by_id(p, 2).unwrap()).unwrap();
    match (va, vb) {
        (FieldValue::Str(sa), FieldValue::Str(sb)) => {
            assert_eq!(&*sa, "abc");
            assert!(Arc::ptr_eq(&sa, &sb));
        }
        other => panic!("expected two strings, got {other:?}"),
    }
}

#[test]
fn append_of_new_field_covers_old_instances() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "y.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    for _ in 0..3 {
        sf.make(p).unwrap();
    }
    sf.write(&file).unwrap();

    let mut sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let y = sf.add_field(p, "y", FieldType::I8).unwrap();
    for id in 1..=3i64 {
        let o = sf.get_by_id(p, id).unwrap();
        sf.set(p, y, &o, FieldValue::I8(id as i8)).unwrap();
    }
    sf.append().unwrap();

    // the field's first chunk spans every block of the pool
    match &sf.pools()[p].declaration(y).unwrap().chunks()[0] {
        Chunk::Bulk {
            total_count,
            block_count,
            ..
        } => {
            assert_eq!(*total_count, 3);
            assert_eq!(*block_count, 2);
        }
        other => panic!("expected a bulk chunk, got {other:?}"),
    }

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let y = sf.pools()[p].field("y").unwrap();
    assert_eq!(sf.size(p), 3);
    for id in 1..=3i64 {
        let o = sf.get_by_id(p, id).unwrap();
        assert_eq!(sf.get(p, y, &o).unwrap(), FieldValue::I8(id as i8));
    }
}

#[test]
fn append_preserves_prior_ids() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "ids.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let s = sf.add_field(p, "s", FieldType::Str).unwrap();
    let a = sf.make(p).unwrap();
    let b = sf.make(p).unwrap();
    sf.set(p, s, &a, FieldValue::Str(Arc::from("x1"))).unwrap();
    sf.set(p, s, &b, FieldValue::Str(Arc::from("x2"))).unwrap();
    sf.write(&file).unwrap();

    let mut sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let s = sf.pools()[p].field("s").unwrap();
    let c = sf.make(p).unwrap();
    sf.set(p, s, &c, FieldValue::Str(Arc::from("x3"))).unwrap();
    sf.append().unwrap();
    assert_eq!(c.skill_id(), 3);

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let s = sf.pools()[p].field("s").unwrap();
    assert_eq!(sf.size(p), 3);
    for (id, expected) in [(1, "x1"), (2, "x2"), (3, "x3")] {
        let o = sf.get_by_id(p, id).unwrap();
        assert_eq!(
            sf.get(p, s, &o).unwrap(),
            FieldValue::Str(Arc::from(expected)),
            "value of instance {id}"
        );
    }
}

#[test]
fn delete_then_compress_reissues_dense_ids() {
    let dir = TempDir::new().unwrap();
    let a = path_in(&dir, "a.sf");
    let b = path_in(&dir, "b.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let v = sf.add_field(p, "v", FieldType::I32).unwrap();
    for i in 0..3 {
        let o = sf.make(p).unwrap();
        sf.set(p, v, &o, FieldValue::I32(10 * (i + 1))).unwrap();
    }
    sf.write(&a).unwrap();

    let mut sf = SkillFile::open(&a, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let doomed = sf.get_by_id(p, 2).unwrap();
    let survivor = sf.get_by_id(p, 3).unwrap();
    sf.delete(&doomed);
    assert_eq!(sf.size(p), 2);
    sf.write(&b).unwrap();
    assert_eq!(survivor.skill_id(), 2);
    assert!(doomed.is_deleted());

    let sf = SkillFile::open(&b, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let v = sf.pools()[p].field("v").unwrap();
    assert_eq!(sf.size(p), 2);
    assert_eq!(
        sf.get(p, v, &sf.get_by_id(p, 1).unwrap()).unwrap(),
        FieldValue::I32(10)
    );
    assert_eq!(
        sf.get(p, v, &sf.get_by_id(p, 2).unwrap()).unwrap(),
        FieldValue::I32(30)
    );
    assert!(sf.get_by_id(p, 3).is_none());
}

#[test]
fn unflushed_deletions_are_not_appended() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "d.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    sf.make(p).unwrap();
    sf.write(&file).unwrap();

    let mut sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let keep = sf.make(p).unwrap();
    let gone = sf.make(p).unwrap();
    sf.delete(&gone);
    sf.append().unwrap();
    assert_eq!(keep.skill_id(), 2);
    assert!(gone.is_deleted());

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    assert_eq!(sf.size(sf.pool("p").unwrap()), 2);
}

#[test]
fn hierarchy_with_references_roundtrips() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "h.sf");

    let mut sf = SkillFile::create();
    let a = sf.create_pool("a", None).unwrap();
    let b = sf.create_pool("b", Some(a)).unwrap();
    let peer = sf.add_field(a, "peer", FieldType::Ref(a)).unwrap();
    let any = sf.add_field(a, "any", FieldType::Annotation).unwrap();
    let oa = sf.make(a).unwrap();
    let ob = sf.make(b).unwrap();
    // a cycle across the hierarchy
    sf.set(a, peer, &oa, FieldValue::Ref(ob.clone())).unwrap();
    sf.set(a, peer, &ob, FieldValue::Ref(oa.clone())).unwrap();
    sf.set(a, any, &oa, FieldValue::Ref(ob.clone())).unwrap();
    sf.write(&file).unwrap();

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let (a, b) = (sf.pool("a").unwrap(), sf.pool("b").unwrap());
    let peer = sf.pools()[a].field("peer").unwrap();
    let any = sf.pools()[a].field("any").unwrap();
    assert_eq!(sf.size(a), 2);
    assert_eq!(sf.size(b), 1);
    assert_eq!(sf.static_size(a), 1);
    assert_eq!(sf.static_size(b), 1);

    let oa = sf.get_by_id(a, 1).unwrap();
    let ob = sf.get_by_id(a, 2).unwrap();
    assert_eq!(ob.pool(), b);
    match sf.get(a, peer, &oa).unwrap() {
        FieldValue::Ref(o) => assert_eq!(o.skill_id(), 2),
        other => panic!("expected a reference, got {other:?}"),
    }
    match sf.get(a, peer, &ob).unwrap() {
        FieldValue::Ref(o) => assert_eq!(o.skill_id(), 1),
        other => panic!("expected a reference, got {other:?}"),
    }
    match sf.get(a, any, &oa).unwrap() {
        FieldValue::Ref(o) => {
            assert_eq!(o.skill_id(), 2);
            assert_eq!(o.pool(), b);
        }
        other => panic!("expected an annotation, got {other:?}"),
    }
    // the subtype pool resolves its own instances, the sibling id misses
    assert!(sf.get_by_id(b, 2).is_some());
    assert!(sf.get_by_id(b, 1).is_none());
}

#[test]
fn compound_values_roundtrip() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "c.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let arr = sf
        .add_field(
            p,
            "arr",
            FieldType::ConstArray {
                len: 2,
                ground: Box::new(FieldType::I16),
            },
        )
        .unwrap();
    let xs = sf
        .add_field(p, "xs", FieldType::List(Box::new(FieldType::V64)))
        .unwrap();
    let m = sf
        .add_field(
            p,
            "m",
            FieldType::Map {
                key: Box::new(FieldType::Str),
                value: Box::new(FieldType::F64),
            },
        )
        .unwrap();
    let o = sf.make(p).unwrap();
    sf.set(
        p,
        arr,
        &o,
        FieldValue::Array(vec![FieldValue::I16(3), FieldValue::I16(-4)]),
    )
    .unwrap();
    sf.set(
        p,
        xs,
        &o,
        FieldValue::Array(vec![FieldValue::I64(200), FieldValue::I64(-1)]),
    )
    .unwrap();
    sf.set(
        p,
        m,
        &o,
        FieldValue::Map(vec![(
            FieldValue::Str(Arc::from("pi")),
            FieldValue::F64(3.25),
        )]),
    )
    .unwrap();
    sf.write(&file).unwrap();

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    let o = sf.get_by_id(p, 1).unwrap();
    let field = |name: &str| sf.pools()[p].field(name).unwrap();
    assert_eq!(
        sf.get(p, field("arr"), &o).unwrap(),
        FieldValue::Array(vec![FieldValue::I16(3), FieldValue::I16(-4)])
    );
    assert_eq!(
        sf.get(p, field("xs"), &o).unwrap(),
        FieldValue::Array(vec![FieldValue::I64(200), FieldValue::I64(-1)])
    );
    assert_eq!(
        sf.get(p, field("m"), &o).unwrap(),
        FieldValue::Map(vec![(
            FieldValue::Str(Arc::from("pi")),
            FieldValue::F64(3.25)
        )])
    );
}

#[test]
fn lazy_and_eager_reads_agree() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "l.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let fields: Vec<i64> = vec![
        sf.add_field(p, "f0", FieldType::I32).unwrap(),
        sf.add_field(p, "f1", FieldType::V64).unwrap(),
        sf.add_field(p, "f2", FieldType::Bool).unwrap(),
        sf.add_field(p, "f3", FieldType::Str).unwrap(),
    ];
    for i in 0..100i64 {
        let o = sf.make(p).unwrap();
        sf.set(p, fields[0], &o, FieldValue::I32(i as i32)).unwrap();
        sf.set(p, fields[1], &o, FieldValue::I64(i * i)).unwrap();
        sf.set(p, fields[2], &o, FieldValue::Bool(i % 2 == 0)).unwrap();
        sf.set(
            p,
            fields[3],
            &o,
            FieldValue::Str(Arc::from(format!("s{}", i % 7).as_str())),
        )
        .unwrap();
    }
    sf.write(&file).unwrap();

    let eager = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let lazy = SkillFile::open(&file, ReadMode::Lazy).unwrap();
    let p = eager.pool("p").unwrap();
    assert_eq!(eager.size(p), lazy.size(p));
    for id in 1..=100 {
        let oe = eager.get_by_id(p, id).unwrap();
        let ol = lazy.get_by_id(p, id).unwrap();
        for &f in &fields {
            assert_eq!(
                eager.get(p, f, &oe).unwrap(),
                lazy.get(p, f, &ol).unwrap(),
                "field {f} of instance {id}"
            );
        }
    }
}

#[test]
fn auto_fields_live_only_in_memory() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "auto.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let x = sf.add_field(p, "x", FieldType::I32).unwrap();
    let cache = sf.add_auto_field(p, "cache", FieldType::Str).unwrap();
    assert!(cache <= 0);
    assert_eq!(sf.pools()[p].field("cache"), Some(cache));
    let o = sf.make(p).unwrap();
    sf.set(p, x, &o, FieldValue::I32(1)).unwrap();
    sf.set(p, cache, &o, FieldValue::Str(Arc::from("transient")))
        .unwrap();
    sf.write(&file).unwrap();

    // both index spaces stay addressable and distinct on the live state
    assert_eq!(
        sf.get(p, cache, &o).unwrap(),
        FieldValue::Str(Arc::from("transient"))
    );
    assert_eq!(sf.get(p, x, &o).unwrap(), FieldValue::I32(1));

    // restrictions reach auto fields too
    sf.add_restriction(p, cache, Box::new(NonNull)).unwrap();
    sf.check().unwrap();
    let fresh = sf.make(p).unwrap();
    sf.set(p, x, &fresh, FieldValue::I32(2)).unwrap();
    assert!(matches!(
        sf.check(),
        Err(SkillError::RestrictionViolation { .. })
    ));
    sf.delete(&fresh);

    // but nothing of the auto field reaches the file
    let bytes = fs::read(&file).unwrap();
    assert_eq!(count_occurrences(&bytes, b"transient"), 0);
    assert_eq!(count_occurrences(&bytes, b"cache"), 0);
    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    assert_eq!(sf.pools()[p].fields().len(), 1);
    assert!(sf.pools()[p].auto_fields().is_empty());
}

#[test]
fn restriction_violations_block_the_write() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "r.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    let s = sf.add_field(p, "s", FieldType::Str).unwrap();
    sf.add_restriction(p, s, Box::new(NonNull)).unwrap();
    let o = sf.make(p).unwrap();

    let err = sf.write(&file).unwrap_err();
    assert!(matches!(err, SkillError::RestrictionViolation { .. }));

    sf.set(p, s, &o, FieldValue::Str(Arc::from("ok"))).unwrap();
    sf.write(&file).unwrap();
}

#[test]
fn appending_to_a_copy_leaves_the_original_alone() {
    let dir = TempDir::new().unwrap();
    let a = path_in(&dir, "a.sf");
    let b = path_in(&dir, "b.sf");

    let mut sf = SkillFile::create();
    let p = sf.create_pool("p", None).unwrap();
    sf.make(p).unwrap();
    sf.write(&a).unwrap();
    let original = fs::read(&a).unwrap();

    let mut sf = SkillFile::open(&a, ReadMode::Eager).unwrap();
    let p = sf.pool("p").unwrap();
    sf.make(p).unwrap();
    sf.append_to(&b).unwrap();

    assert_eq!(fs::read(&a).unwrap(), original);
    let sf = SkillFile::open(&b, ReadMode::Eager).unwrap();
    assert_eq!(sf.size(sf.pool("p").unwrap()), 2);
}

#[test]
fn subtypes_appended_after_the_fact() {
    let dir = TempDir::new().unwrap();
    let file = path_in(&dir, "sub.sf");

    let mut sf = SkillFile::create();
    let a = sf.create_pool("a", None).unwrap();
    sf.make(a).unwrap();
    sf.write(&file).unwrap();

    // a subtype declared only in the second block
    let mut sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let a = sf.pool("a").unwrap();
    let b = sf.create_pool("b", Some(a)).unwrap();
    sf.make(b).unwrap();
    sf.append().unwrap();

    let sf = SkillFile::open(&file, ReadMode::Eager).unwrap();
    let (a, b) = (sf.pool("a").unwrap(), sf.pool("b").unwrap());
    assert_eq!(sf.size(a), 2);
    assert_eq!(sf.size(b), 1);
    let sub = sf.get_by_id(b, 2).unwrap();
    assert_eq!(sub.pool(), b);
}
