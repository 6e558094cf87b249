use cahier::address::{ContainerAddress, NodeAddress};
use cahier::core::{Document, EntryKind, Item, Section, Separator, TopLevelEntry};
use cahier::history::History;
use cahier::mutations::{EditError, attach_separator, insert_entry, insert_item, insert_section};
use cahier::projectors::flatten::{RowKind, flatten};
use cahier::storage::{DocumentStore, FileStore};

fn outline(doc: &Document) -> Vec<(RowKind, String)> {
    flatten(doc)
        .iter()
        .map(|row| (row.kind, row.node.heading().to_string()))
        .collect()
}

#[test]
fn build_undo_redo_a_small_log() {
    let mut history = History::new(Document::new());
    history
        .apply("add chapter", |doc| {
            insert_entry(doc, TopLevelEntry::new(EntryKind::Chapter, "Algebra"), None)
        })
        .expect("add chapter");
    history
        .apply("add section", |doc| {
            insert_section(doc, NodeAddress::entry(0), Section::new("A"), None)
        })
        .expect("add section");
    history
        .apply("add item", |doc| {
            insert_item(doc, NodeAddress::section(0, 0), Item::new("exercise", "Warm-up"), None)
        })
        .expect("add item");

    let full = vec![
        (RowKind::Entry(EntryKind::Chapter), "Algebra".to_string()),
        (RowKind::Section, "A".to_string()),
        (RowKind::Item, "Warm-up".to_string()),
    ];
    assert_eq!(outline(history.current()), full);

    assert!(history.undo());
    assert_eq!(outline(history.current()), full[..2]);

    assert!(history.redo());
    assert_eq!(outline(history.current()), full);
}

#[test]
fn undo_all_then_redo_all() {
    let mut history = History::new(Document::new());
    let mut states = vec![history.current().clone()];
    for title in ["One", "Two", "Three"] {
        history
            .apply(title, |doc| insert_entry(doc, TopLevelEntry::new(EntryKind::Chapter, title), None))
            .expect("apply");
        states.push(history.current().clone());
    }
    let after_first = states[1].clone();

    while history.undo() {}
    assert_eq!(history.current(), &states[0]);
    while history.redo() {}
    assert_eq!(history.current(), &states[3]);
    assert_eq!(states[1], after_first);
}

#[test]
fn second_separator_is_refused() {
    let mut history = History::new(Document::new());
    history
        .apply("add chapter", |doc| {
            insert_entry(doc, TopLevelEntry::new(EntryKind::Chapter, "Algebra"), None)
        })
        .expect("add chapter");
    let at = NodeAddress::entry(0);
    history
        .apply("separator", |doc| attach_separator(doc, at, Separator::new("Week 1", true)))
        .expect("first separator");
    let err = history
        .apply("separator", |doc| attach_separator(doc, at, Separator::new("Week 2", true)))
        .expect_err("second separator");
    assert_eq!(err, EditError::AttachmentConflict(at));

    let rows = outline(history.current());
    assert_eq!(rows[1], (RowKind::Separator, "Week 1".to_string()));
}

#[test]
fn edits_persist_through_a_file_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = FileStore::new(dir.path());
    let (doc, problem) = store.load("maths").expect("load empty");
    assert!(problem.is_none());

    let mut history = History::new(doc);
    history
        .apply("add chapter", |doc| {
            insert_entry(doc, TopLevelEntry::new(EntryKind::HomeAssignment, "DM 1"), None)
        })
        .expect("add");
    history
        .apply("add section", |doc| {
            insert_section(doc, NodeAddress::entry(0), Section::new("Exercises"), None)
        })
        .expect("add section");
    history
        .apply("add item", |doc| {
            let item = Item::new("théorème", "Thales");
            insert_item(doc, ContainerAddress::section(0, 0).into(), item, None)
        })
        .expect("add item");
    store.save("maths", history.current()).expect("save");

    let text = std::fs::read_to_string(dir.path().join("maths.json")).expect("read back");
    assert!(text.contains("\"type\": \"home-assignment\""));
    assert!(text.contains("\"type\": \"theorem\""));
    assert!(!text.contains("temporaryId"));

    let (reloaded, problem) = store.load("maths").expect("reload");
    assert!(problem.is_none());
    assert_eq!(outline(&reloaded), outline(history.current()));
}
