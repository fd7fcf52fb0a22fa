//! The frontend's output must reparse into a tree whose function set and
//! parameter signatures match the source.
use std::fs;

use coatl::{ir, ir::Node, source_to_ir};

/// (name, params as (name, type)) for every function in the IR tree.
fn function_signatures(root: &Node) -> Vec<(String, Vec<(String, String)>)> {
    let top = root.as_list().expect("root should be a list");
    assert_eq!(top[0].as_atom(), Some("coatl_ir"));
    assert_eq!(top[1].as_atom(), Some("v1"));

    let fns = top[3].as_list().expect("functions section");
    assert_eq!(fns[0].as_atom(), Some("functions"));

    fns[1..]
        .iter()
        .map(|f| {
            let items = f.as_list().expect("fn node");
            assert_eq!(items[0].as_atom(), Some("fn"));
            let name = items[1].as_atom().expect("fn name").to_owned();
            let params = items[2].as_list().expect("params")[1..]
                .iter()
                .map(|p| {
                    let pl = p.as_list().expect("param node");
                    (
                        pl[1].as_atom().unwrap().to_owned(),
                        pl[2].as_atom().unwrap().to_owned(),
                    )
                })
                .collect();
            (name, params)
        })
        .collect()
}

#[test]
fn frontend_output_reparses_for_every_demo() {
    for entry in fs::read_dir("./demos").expect("demos directory") {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("coatl") {
            continue;
        }
        let source = fs::read_to_string(&path).unwrap();
        let Ok(ir_text) = source_to_ir(&source) else {
            // Negative demos are covered by the parser error tests.
            continue;
        };
        let root = ir::parse(&ir_text)
            .unwrap_or_else(|err| panic!("{} produced unreadable IR: {err}", path.display()));
        assert!(!function_signatures(&root).is_empty());
    }
}

#[test]
fn signatures_survive_the_round_trip() {
    let source = fs::read_to_string("./demos/add.coatl").unwrap();
    let root = ir::parse(&source_to_ir(&source).unwrap()).unwrap();

    let sigs = function_signatures(&root);
    assert_eq!(sigs.len(), 2);
    assert_eq!(sigs[0].0, "add");
    assert_eq!(
        sigs[0].1,
        vec![
            ("a".to_owned(), "i32".to_owned()),
            ("b".to_owned(), "i32".to_owned()),
        ]
    );
    assert_eq!(sigs[1].0, "main");
    assert!(sigs[1].1.is_empty());
}

#[test]
fn struct_return_functions_expand_to_companions() {
    let source = fs::read_to_string("./demos/point.coatl").unwrap();
    let root = ir::parse(&source_to_ir(&source).unwrap()).unwrap();

    let names: Vec<String> = function_signatures(&root)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["mk__ret__x", "mk__ret__y", "main"]);
}
