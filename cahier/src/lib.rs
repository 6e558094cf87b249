//! Lesson-log ("cahier de textes") document core.
//! Modules keep the core pure: the schema, structural addressing, copy-on-write edits,
//! a bounded snapshot history, and projectors that linearize the tree for table and print views.

pub mod core {
    use crate::address::{ContainerAddress, NodeAddress};
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serialize};
    use std::{fmt, sync::Arc};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Transient marker flagging a node as "just created". Never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FreshId(pub Uuid);

    impl FreshId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for FreshId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the whole lesson log. Serialized as a bare array of entries.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Document {
        pub entries: Vec<Arc<TopLevelEntry>>,
    }

    impl Document {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_entries(entries: impl IntoIterator<Item = TopLevelEntry>) -> Self {
            Self {
                entries: entries.into_iter().map(Arc::new).collect(),
            }
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }
    }

    /* ------------------------------ Kinds ------------------------------ */

    /// Closed set of top-level entry kinds: a chapter or a graded-work unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub enum EntryKind {
        Chapter,
        DiagnosticEvaluation,
        HomeAssignment,
        ContinuousAssessment,
        HomeAssignmentCorrection,
        ContinuousAssessmentCorrection,
    }

    impl EntryKind {
        pub const ALL: [EntryKind; 6] = [
            EntryKind::Chapter,
            EntryKind::DiagnosticEvaluation,
            EntryKind::HomeAssignment,
            EntryKind::ContinuousAssessment,
            EntryKind::HomeAssignmentCorrection,
            EntryKind::ContinuousAssessmentCorrection,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                EntryKind::Chapter => "chapter",
                EntryKind::DiagnosticEvaluation => "diagnostic-evaluation",
                EntryKind::HomeAssignment => "home-assignment",
                EntryKind::ContinuousAssessment => "continuous-assessment",
                EntryKind::HomeAssignmentCorrection => "home-assignment-correction",
                EntryKind::ContinuousAssessmentCorrection => "continuous-assessment-correction",
            }
        }

        /// Display label used by the printed log.
        pub fn label(self) -> &'static str {
            match self {
                EntryKind::Chapter => "Chapitre",
                EntryKind::DiagnosticEvaluation => "Évaluation diagnostique",
                EntryKind::HomeAssignment => "Devoir maison",
                EntryKind::ContinuousAssessment => "Devoir surveillé",
                EntryKind::HomeAssignmentCorrection => "Correction du devoir maison",
                EntryKind::ContinuousAssessmentCorrection => "Correction du devoir surveillé",
            }
        }

        /// Accepts canonical names and the French labels found in older logs.
        pub fn parse(raw: &str) -> Option<Self> {
            let kind = match fold_label(raw).as_str() {
                "chapter" | "chapitre" => EntryKind::Chapter,
                "diagnostic-evaluation" | "evaluation-diagnostique" | "evaluation" => {
                    EntryKind::DiagnosticEvaluation
                }
                "home-assignment" | "devoir-maison" | "dm" => EntryKind::HomeAssignment,
                "continuous-assessment" | "devoir-surveille" | "ds" | "controle" => {
                    EntryKind::ContinuousAssessment
                }
                "home-assignment-correction"
                | "correction-devoir-maison"
                | "correction-du-devoir-maison"
                | "correction-dm" => EntryKind::HomeAssignmentCorrection,
                "continuous-assessment-correction"
                | "correction-devoir-surveille"
                | "correction-du-devoir-surveille"
                | "correction-ds" => EntryKind::ContinuousAssessmentCorrection,
                _ => return None,
            };
            Some(kind)
        }

        pub fn supports_sections(self) -> bool {
            match self {
                EntryKind::Chapter
                | EntryKind::DiagnosticEvaluation
                | EntryKind::HomeAssignment
                | EntryKind::ContinuousAssessment
                | EntryKind::HomeAssignmentCorrection
                | EntryKind::ContinuousAssessmentCorrection => true,
            }
        }

        /// Graded-work kinds may also be embedded inside an `items` collection.
        pub fn is_embeddable(self) -> bool {
            !matches!(self, EntryKind::Chapter)
        }
    }

    impl fmt::Display for EntryKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown entry kind {0:?}")]
    pub struct UnknownKind(pub String);

    impl TryFrom<String> for EntryKind {
        type Error = UnknownKind;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            EntryKind::parse(&value).ok_or(UnknownKind(value))
        }
    }

    impl From<EntryKind> for String {
        fn from(kind: EntryKind) -> Self {
            kind.as_str().to_string()
        }
    }

    /// Canonical pedagogical item types. `Unknown` keeps unrecognized labels verbatim.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "String", into = "String")]
    pub enum ItemType {
        Definition,
        Theorem,
        Property,
        Proposition,
        Lemma,
        Corollary,
        Proof,
        Example,
        CounterExample,
        Exercise,
        Remark,
        Method,
        Activity,
        Lesson,
        Notation,
        Unknown(String),
    }

    impl ItemType {
        /// Runs the synonym table: case, accents and separators are ignored.
        pub fn parse(raw: &str) -> Self {
            match fold_label(raw).as_str() {
                "definition" | "def" => ItemType::Definition,
                "theorem" | "theoreme" | "thm" => ItemType::Theorem,
                "property" | "propriete" | "prop" => ItemType::Property,
                "proposition" => ItemType::Proposition,
                "lemma" | "lemme" => ItemType::Lemma,
                "corollary" | "corollaire" => ItemType::Corollary,
                "proof" | "demonstration" | "preuve" => ItemType::Proof,
                "example" | "exemple" => ItemType::Example,
                "counter-example" | "counterexample" | "contre-exemple" => {
                    ItemType::CounterExample
                }
                "exercise" | "exercice" | "exo" => ItemType::Exercise,
                "remark" | "remarque" | "rq" => ItemType::Remark,
                "method" | "methode" => ItemType::Method,
                "activity" | "activite" => ItemType::Activity,
                "lesson" | "cours" | "lecon" => ItemType::Lesson,
                "notation" | "notations" => ItemType::Notation,
                _ => ItemType::Unknown(raw.trim().to_string()),
            }
        }

        pub fn as_str(&self) -> &str {
            match self {
                ItemType::Definition => "definition",
                ItemType::Theorem => "theorem",
                ItemType::Property => "property",
                ItemType::Proposition => "proposition",
                ItemType::Lemma => "lemma",
                ItemType::Corollary => "corollary",
                ItemType::Proof => "proof",
                ItemType::Example => "example",
                ItemType::CounterExample => "counter-example",
                ItemType::Exercise => "exercise",
                ItemType::Remark => "remark",
                ItemType::Method => "method",
                ItemType::Activity => "activity",
                ItemType::Lesson => "lesson",
                ItemType::Notation => "notation",
                ItemType::Unknown(raw) => raw,
            }
        }

        pub fn is_known(&self) -> bool {
            !matches!(self, ItemType::Unknown(_))
        }
    }

    impl From<String> for ItemType {
        fn from(value: String) -> Self {
            ItemType::parse(&value)
        }
    }

    impl From<ItemType> for String {
        fn from(kind: ItemType) -> Self {
            kind.as_str().to_string()
        }
    }

    fn fold_label(raw: &str) -> String {
        raw.trim()
            .chars()
            .flat_map(char::to_lowercase)
            .map(|c| match c {
                'à' | 'â' | 'ä' => 'a',
                'é' | 'è' | 'ê' | 'ë' => 'e',
                'î' | 'ï' => 'i',
                'ô' | 'ö' => 'o',
                'ù' | 'û' | 'ü' => 'u',
                'ç' => 'c',
                '_' | ' ' => '-',
                other => other,
            })
            .collect()
    }

    /// Dates are stored as typed by the user; this reads the ISO form when present.
    pub fn parse_date(raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Marker attached after a node, carrying its own text and date.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Separator {
        #[serde(default)]
        pub content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        /// Inserted by the user rather than derived from structure.
        #[serde(default)]
        pub manual: bool,
        #[serde(skip)]
        pub id: Option<FreshId>,
    }

    impl Separator {
        pub fn new(content: impl Into<String>, manual: bool) -> Self {
            Self {
                content: content.into(),
                date: None,
                manual,
                id: Some(FreshId::new()),
            }
        }

        pub fn with_date(mut self, date: impl Into<String>) -> Self {
            self.date = Some(date.into());
            self
        }
    }

    /// A chapter or graded-work unit anchoring the top level.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TopLevelEntry {
        #[serde(rename = "type", alias = "kind")]
        pub kind: EntryKind,
        #[serde(default)]
        pub title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
        #[serde(default)]
        pub sections: Vec<Arc<Section>>,
        /// Kind label found on load that matched no known kind. The entry is read as a
        /// chapter and the label is kept so it survives a save and shows up in `validate`.
        #[serde(
            default,
            rename = "unrecognizedType",
            skip_serializing_if = "Option::is_none"
        )]
        pub unrecognized_kind: Option<String>,
        #[serde(skip)]
        pub temporary_id: Option<FreshId>,
    }

    impl TopLevelEntry {
        pub fn new(kind: EntryKind, title: impl Into<String>) -> Self {
            Self {
                kind,
                title: title.into(),
                date: None,
                remark: None,
                separator_after: None,
                sections: vec![],
                unrecognized_kind: None,
                temporary_id: Some(FreshId::new()),
            }
        }

        pub fn is_fresh(&self) -> bool {
            self.temporary_id.is_some()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Section {
        #[serde(default)]
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
        /// Visited before `items` when both are populated.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub subsections: Vec<Arc<SubSection>>,
        #[serde(default)]
        pub items: Vec<Arc<ItemEntry>>,
    }

    impl Section {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SubSection {
        #[serde(default)]
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub subsubsections: Vec<Arc<SubSubSection>>,
        #[serde(default)]
        pub items: Vec<Arc<ItemEntry>>,
    }

    impl SubSection {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }
    }

    /// Deepest structural level: holds items only.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SubSubSection {
        #[serde(default)]
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
        #[serde(default)]
        pub items: Vec<Arc<ItemEntry>>,
    }

    impl SubSubSection {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }
    }

    /// Leaf pedagogical unit (definition, exercise, ...).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Item {
        #[serde(rename = "type")]
        pub kind: ItemType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub page: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
    }

    impl Item {
        pub fn new(kind: &str, title: impl Into<String>) -> Self {
            Self {
                kind: ItemType::parse(kind),
                number: None,
                title: Some(title.into()),
                description: None,
                page: None,
                date: None,
                remark: None,
                separator_after: None,
            }
        }
    }

    /// A graded-work entry placed inside an `items` collection. Has no sections.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EmbeddedEntry {
        #[serde(rename = "type")]
        pub kind: EntryKind,
        #[serde(default)]
        pub title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub remark: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub separator_after: Option<Separator>,
    }

    impl EmbeddedEntry {
        pub fn new(kind: EntryKind, title: impl Into<String>) -> Self {
            Self {
                kind,
                title: title.into(),
                date: None,
                remark: None,
                separator_after: None,
            }
        }
    }

    /// Member of an `items` collection, discriminated by its `type` against the entry kinds.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum ItemEntry {
        Embedded(EmbeddedEntry),
        Item(Item),
    }

    impl ItemEntry {
        pub fn entry_kind(&self) -> Option<EntryKind> {
            match self {
                ItemEntry::Embedded(e) => Some(e.kind),
                ItemEntry::Item(_) => None,
            }
        }

        pub fn title(&self) -> &str {
            match self {
                ItemEntry::Embedded(e) => &e.title,
                ItemEntry::Item(i) => i.title.as_deref().unwrap_or(""),
            }
        }

        fn as_annotated(&self) -> &dyn Annotated {
            match self {
                ItemEntry::Embedded(e) => e,
                ItemEntry::Item(i) => i,
            }
        }

        fn as_annotated_mut(&mut self) -> &mut dyn Annotated {
            match self {
                ItemEntry::Embedded(e) => e,
                ItemEntry::Item(i) => i,
            }
        }
    }

    impl From<Item> for ItemEntry {
        fn from(item: Item) -> Self {
            ItemEntry::Item(item)
        }
    }

    impl From<EmbeddedEntry> for ItemEntry {
        fn from(entry: EmbeddedEntry) -> Self {
            ItemEntry::Embedded(entry)
        }
    }

    /// Flat wire shape of an `items` member before classification.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct RawItemEntry {
        #[serde(default, rename = "type", alias = "kind")]
        pub kind: String,
        #[serde(default)]
        pub number: Option<String>,
        #[serde(default)]
        pub title: Option<String>,
        #[serde(default)]
        pub description: Option<String>,
        #[serde(default)]
        pub page: Option<String>,
        #[serde(default)]
        pub date: Option<String>,
        #[serde(default)]
        pub remark: Option<String>,
        #[serde(default)]
        pub separator_after: Option<Separator>,
    }

    impl From<RawItemEntry> for ItemEntry {
        fn from(raw: RawItemEntry) -> Self {
            match EntryKind::parse(&raw.kind).filter(|kind| kind.is_embeddable()) {
                Some(kind) => ItemEntry::Embedded(EmbeddedEntry {
                    kind,
                    title: raw.title.unwrap_or_default(),
                    date: raw.date,
                    remark: raw.remark,
                    separator_after: raw.separator_after,
                }),
                None => ItemEntry::Item(Item {
                    kind: ItemType::parse(&raw.kind),
                    number: raw.number,
                    title: raw.title,
                    description: raw.description,
                    page: raw.page,
                    date: raw.date,
                    remark: raw.remark,
                    separator_after: raw.separator_after,
                }),
            }
        }
    }

    impl From<ItemEntry> for RawItemEntry {
        fn from(entry: ItemEntry) -> Self {
            match entry {
                ItemEntry::Embedded(e) => RawItemEntry {
                    kind: e.kind.as_str().to_string(),
                    title: Some(e.title),
                    date: e.date,
                    remark: e.remark,
                    separator_after: e.separator_after,
                    ..RawItemEntry::default()
                },
                ItemEntry::Item(i) => RawItemEntry {
                    kind: i.kind.as_str().to_string(),
                    number: i.number,
                    title: i.title,
                    description: i.description,
                    page: i.page,
                    date: i.date,
                    remark: i.remark,
                    separator_after: i.separator_after,
                },
            }
        }
    }

    impl<'de> Deserialize<'de> for ItemEntry {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            RawItemEntry::deserialize(deserializer).map(ItemEntry::from)
        }
    }

    /* ----------------------- Shared node attributes ----------------------- */

    /// Attributes every node carries: date, remark and the optional trailing separator.
    pub trait Annotated {
        fn date(&self) -> Option<&str>;
        fn remark(&self) -> Option<&str>;
        fn separator_after(&self) -> Option<&Separator>;
        fn date_slot(&mut self) -> &mut Option<String>;
        fn remark_slot(&mut self) -> &mut Option<String>;
        fn separator_slot(&mut self) -> &mut Option<Separator>;
    }

    macro_rules! annotated {
        ($($ty:ty),+ $(,)?) => {$(
            impl Annotated for $ty {
                fn date(&self) -> Option<&str> {
                    self.date.as_deref()
                }
                fn remark(&self) -> Option<&str> {
                    self.remark.as_deref()
                }
                fn separator_after(&self) -> Option<&Separator> {
                    self.separator_after.as_ref()
                }
                fn date_slot(&mut self) -> &mut Option<String> {
                    &mut self.date
                }
                fn remark_slot(&mut self) -> &mut Option<String> {
                    &mut self.remark
                }
                fn separator_slot(&mut self) -> &mut Option<Separator> {
                    &mut self.separator_after
                }
            }
        )+};
    }

    annotated!(TopLevelEntry, Section, SubSection, SubSubSection, Item, EmbeddedEntry);

    impl Annotated for ItemEntry {
        fn date(&self) -> Option<&str> {
            self.as_annotated().date()
        }
        fn remark(&self) -> Option<&str> {
            self.as_annotated().remark()
        }
        fn separator_after(&self) -> Option<&Separator> {
            self.as_annotated().separator_after()
        }
        fn date_slot(&mut self) -> &mut Option<String> {
            self.as_annotated_mut().date_slot()
        }
        fn remark_slot(&mut self) -> &mut Option<String> {
            self.as_annotated_mut().remark_slot()
        }
        fn separator_slot(&mut self) -> &mut Option<Separator> {
            self.as_annotated_mut().separator_slot()
        }
    }

    /* ------------------------- Conformance check ------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum SchemaProblem {
        #[error("missing title")]
        MissingTitle,
        #[error("unknown item type {0:?}")]
        UnknownItemType(String),
        #[error("unknown entry kind {0:?}")]
        UnknownEntryKind(String),
        #[error("{0:?} is not allowed inside an items collection")]
        IllegalChild(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SchemaIssue {
        pub address: NodeAddress,
        pub problem: SchemaProblem,
    }

    impl fmt::Display for SchemaIssue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {}", self.address, self.problem)
        }
    }

    /// Structural validity: blank titles/names, unknown item types, chapters inside items.
    pub fn validate(doc: &Document) -> Vec<SchemaIssue> {
        fn require(issues: &mut Vec<SchemaIssue>, address: NodeAddress, text: &str) {
            if text.trim().is_empty() {
                issues.push(SchemaIssue {
                    address,
                    problem: SchemaProblem::MissingTitle,
                });
            }
        }

        let mut issues = Vec::new();

        let mut item_lists = Vec::new();
        for (e, entry) in doc.entries.iter().enumerate() {
            require(&mut issues, NodeAddress::entry(e), &entry.title);
            if let Some(raw) = &entry.unrecognized_kind {
                issues.push(SchemaIssue {
                    address: NodeAddress::entry(e),
                    problem: SchemaProblem::UnknownEntryKind(raw.clone()),
                });
            }
            for (s, section) in entry.sections.iter().enumerate() {
                require(&mut issues, NodeAddress::section(e, s), &section.name);
                for (u, sub) in section.subsections.iter().enumerate() {
                    require(&mut issues, NodeAddress::subsection(e, s, u), &sub.name);
                    for (v, subsub) in sub.subsubsections.iter().enumerate() {
                        require(&mut issues, NodeAddress::subsubsection(e, s, u, v), &subsub.name);
                        item_lists.push((
                            ContainerAddress::subsubsection(e, s, u, v),
                            &subsub.items,
                        ));
                    }
                    item_lists.push((ContainerAddress::subsection(e, s, u), &sub.items));
                }
                item_lists.push((ContainerAddress::section(e, s), &section.items));
            }
        }

        for (container, items) in item_lists {
            for (i, entry) in items.iter().enumerate() {
                let address = container.item(i);
                match entry.as_ref() {
                    ItemEntry::Embedded(embedded) => require(&mut issues, address, &embedded.title),
                    ItemEntry::Item(Item {
                        kind: ItemType::Unknown(raw),
                        ..
                    }) => {
                        let problem = if EntryKind::parse(raw) == Some(EntryKind::Chapter) {
                            SchemaProblem::IllegalChild(raw.clone())
                        } else {
                            SchemaProblem::UnknownItemType(raw.clone())
                        };
                        issues.push(SchemaIssue { address, problem });
                    }
                    ItemEntry::Item(_) => {}
                }
            }
        }
        issues
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::migrate::load_str;

        #[test]
        fn item_type_synonyms_canonicalize() {
            for raw in ["theorem", "Théorème", "theoreme", " THM "] {
                assert_eq!(ItemType::parse(raw), ItemType::Theorem, "{raw}");
            }
            assert_eq!(ItemType::parse("Exercice"), ItemType::Exercise);
            assert_eq!(
                ItemType::parse("puzzle"),
                ItemType::Unknown("puzzle".to_string())
            );
        }

        #[test]
        fn entry_kinds_accept_french_labels() {
            assert_eq!(EntryKind::parse("Devoir surveillé"), Some(EntryKind::ContinuousAssessment));
            assert_eq!(EntryKind::parse("devoir_maison"), Some(EntryKind::HomeAssignment));
            assert_eq!(EntryKind::parse("chapitre"), Some(EntryKind::Chapter));
            assert_eq!(EntryKind::parse("exercise"), None);
            for kind in EntryKind::ALL {
                assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
            }
        }

        #[test]
        fn items_discriminate_embedded_entries() {
            let doc = load_str(
                r#"[{"type":"chapter","title":"A","sections":[{"name":"S","items":[
                    {"type":"devoir-surveille","title":"DS 1"},
                    {"type":"exemple","title":"Ex"}
                ]}]}]"#,
            )
            .expect("fixture");
            let items = &doc.entries[0].sections[0].items;
            assert_eq!(items[0].entry_kind(), Some(EntryKind::ContinuousAssessment));
            assert!(matches!(items[1].as_ref(), ItemEntry::Item(i) if i.kind == ItemType::Example));
        }

        #[test]
        fn serialization_uses_wire_field_names() {
            let mut entry = TopLevelEntry::new(EntryKind::Chapter, "Algebra");
            entry.separator_after = Some(Separator::new("Break", true));
            let json = serde_json::to_value(Document::from_entries([entry])).expect("serialize");
            let first = &json[0];
            assert_eq!(first["type"], "chapter");
            assert_eq!(first["separatorAfter"]["content"], "Break");
            assert!(first.get("temporaryId").is_none());
            assert_eq!(first["sections"], serde_json::json!([]));
        }

        #[test]
        fn validate_reports_blank_titles_and_bad_items() {
            let doc = load_str(
                r#"[{"type":"chapter","title":" ","sections":[{"name":"S","items":[
                    {"type":"chapter","title":"nested"},
                    {"type":"puzzle"},
                    {"type":"definition"}
                ]}]}]"#,
            )
            .expect("fixture");
            let issues = validate(&doc);
            let problems: Vec<_> = issues.iter().map(|i| i.problem.clone()).collect();
            assert_eq!(
                problems,
                vec![
                    SchemaProblem::MissingTitle,
                    SchemaProblem::IllegalChild("chapter".into()),
                    SchemaProblem::UnknownItemType("puzzle".into()),
                ]
            );
            assert_eq!(issues[1].address, ContainerAddress::section(0, 0).item(0));
        }

        #[test]
        fn parse_date_reads_iso_dates_only() {
            assert_eq!(parse_date("2025-01-02"), NaiveDate::from_ymd_opt(2025, 1, 2));
            assert_eq!(parse_date("mardi"), None);
        }
    }
}

pub mod address {
    //! Structural addresses and the path resolver.
    //!
    //! Depth is bounded (entry → section → subsection → sub-subsection → item), so an
    //! address is a sum type per level rather than a list of optional indices. Resolution
    //! walks top-down and returns `None` on the first missing step; it never panics.

    use crate::core::*;
    use nom::{
        IResult,
        bytes::complete::tag,
        character::complete::{char, digit1},
        combinator::{all_consuming, map_res, opt, value},
        multi::separated_list1,
        sequence::{preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr, sync::Arc};

    /* ---------------------------- Address types ---------------------------- */

    /// A node that owns an `items` collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ContainerAddress {
        Section {
            entry: usize,
            section: usize,
        },
        SubSection {
            entry: usize,
            section: usize,
            subsection: usize,
        },
        SubSubSection {
            entry: usize,
            section: usize,
            subsection: usize,
            subsubsection: usize,
        },
    }

    impl ContainerAddress {
        pub fn section(entry: usize, section: usize) -> Self {
            Self::Section { entry, section }
        }

        pub fn subsection(entry: usize, section: usize, subsection: usize) -> Self {
            Self::SubSection {
                entry,
                section,
                subsection,
            }
        }

        pub fn subsubsection(
            entry: usize,
            section: usize,
            subsection: usize,
            subsubsection: usize,
        ) -> Self {
            Self::SubSubSection {
                entry,
                section,
                subsection,
                subsubsection,
            }
        }

        pub fn item(self, item: usize) -> NodeAddress {
            NodeAddress::Item {
                container: self,
                item,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum NodeAddress {
        Entry {
            entry: usize,
        },
        Section {
            entry: usize,
            section: usize,
        },
        SubSection {
            entry: usize,
            section: usize,
            subsection: usize,
        },
        SubSubSection {
            entry: usize,
            section: usize,
            subsection: usize,
            subsubsection: usize,
        },
        Item {
            container: ContainerAddress,
            item: usize,
        },
    }

    impl NodeAddress {
        pub fn entry(entry: usize) -> Self {
            Self::Entry { entry }
        }

        pub fn section(entry: usize, section: usize) -> Self {
            ContainerAddress::section(entry, section).into()
        }

        pub fn subsection(entry: usize, section: usize, subsection: usize) -> Self {
            ContainerAddress::subsection(entry, section, subsection).into()
        }

        pub fn subsubsection(
            entry: usize,
            section: usize,
            subsection: usize,
            subsubsection: usize,
        ) -> Self {
            ContainerAddress::subsubsection(entry, section, subsection, subsubsection).into()
        }

        /// Position of the node inside its own collection.
        pub fn index(self) -> usize {
            match self {
                NodeAddress::Entry { entry } => entry,
                NodeAddress::Section { section, .. } => section,
                NodeAddress::SubSection { subsection, .. } => subsection,
                NodeAddress::SubSubSection { subsubsection, .. } => subsubsection,
                NodeAddress::Item { item, .. } => item,
            }
        }

        /// The owning node, or `None` for entries (owned by the document).
        pub fn parent(self) -> Option<NodeAddress> {
            match self {
                NodeAddress::Entry { .. } => None,
                NodeAddress::Section { entry, .. } => Some(NodeAddress::entry(entry)),
                NodeAddress::SubSection { entry, section, .. } => {
                    Some(NodeAddress::section(entry, section))
                }
                NodeAddress::SubSubSection {
                    entry,
                    section,
                    subsection,
                    ..
                } => Some(NodeAddress::subsection(entry, section, subsection)),
                NodeAddress::Item { container, .. } => Some(container.into()),
            }
        }

        pub fn as_container(self) -> Option<ContainerAddress> {
            match self {
                NodeAddress::Section { entry, section } => {
                    Some(ContainerAddress::section(entry, section))
                }
                NodeAddress::SubSection {
                    entry,
                    section,
                    subsection,
                } => Some(ContainerAddress::subsection(entry, section, subsection)),
                NodeAddress::SubSubSection {
                    entry,
                    section,
                    subsection,
                    subsubsection,
                } => Some(ContainerAddress::subsubsection(
                    entry,
                    section,
                    subsection,
                    subsubsection,
                )),
                NodeAddress::Entry { .. } | NodeAddress::Item { .. } => None,
            }
        }

        pub fn separator(self) -> Address {
            Address::Separator(self)
        }
    }

    impl From<ContainerAddress> for NodeAddress {
        fn from(container: ContainerAddress) -> Self {
            match container {
                ContainerAddress::Section { entry, section } => {
                    NodeAddress::Section { entry, section }
                }
                ContainerAddress::SubSection {
                    entry,
                    section,
                    subsection,
                } => NodeAddress::SubSection {
                    entry,
                    section,
                    subsection,
                },
                ContainerAddress::SubSubSection {
                    entry,
                    section,
                    subsection,
                    subsubsection,
                } => NodeAddress::SubSubSection {
                    entry,
                    section,
                    subsection,
                    subsubsection,
                },
            }
        }
    }

    /// A node, or the separator attached after it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Address {
        Node(NodeAddress),
        Separator(NodeAddress),
    }

    impl Address {
        /// The addressed node, or the separator's owner.
        pub fn node(self) -> NodeAddress {
            match self {
                Address::Node(node) | Address::Separator(node) => node,
            }
        }

        pub fn is_separator(self) -> bool {
            matches!(self, Address::Separator(_))
        }
    }

    impl From<NodeAddress> for Address {
        fn from(node: NodeAddress) -> Self {
            Address::Node(node)
        }
    }

    /* ---------------------------- Textual form ---------------------------- */

    impl fmt::Display for ContainerAddress {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match *self {
                ContainerAddress::Section { entry, section } => write!(f, "{entry}.{section}"),
                ContainerAddress::SubSection {
                    entry,
                    section,
                    subsection,
                } => write!(f, "{entry}.{section}.{subsection}"),
                ContainerAddress::SubSubSection {
                    entry,
                    section,
                    subsection,
                    subsubsection,
                } => write!(f, "{entry}.{section}.{subsection}.{subsubsection}"),
            }
        }
    }

    impl fmt::Display for NodeAddress {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match *self {
                NodeAddress::Entry { entry } => write!(f, "{entry}"),
                NodeAddress::Item { container, item } => write!(f, "{container}#{item}"),
                other => match other.as_container() {
                    Some(container) => write!(f, "{container}"),
                    None => Ok(()),
                },
            }
        }
    }

    impl fmt::Display for Address {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Address::Node(node) => write!(f, "{node}"),
                Address::Separator(node) => write!(f, "{node}/sep"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum AddressParseError {
        #[error("malformed address {0:?} (expected e.g. `0.1`, `0.1.2#3`, `0.1/sep`)")]
        Syntax(String),
        #[error("address {0:?} nests deeper than sub-subsections")]
        TooDeep(String),
        #[error("address {0:?} puts an item directly under an entry")]
        ItemOutsideSection(String),
    }

    type Parts = (Vec<usize>, Option<usize>, Option<()>);

    fn index(i: &str) -> IResult<&str, usize> {
        map_res(digit1, |s: &str| s.parse::<usize>())(i)
    }

    fn address_parts(i: &str) -> IResult<&str, Parts> {
        all_consuming(tuple((
            separated_list1(char('.'), index),
            opt(preceded(char('#'), index)),
            opt(value((), tag("/sep"))),
        )))(i)
    }

    impl FromStr for Address {
        type Err = AddressParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let input = s.trim();
            let (_, (indices, item, separator)) =
                address_parts(input).map_err(|_| AddressParseError::Syntax(input.to_string()))?;

            let container = match indices.as_slice() {
                &[_] => {
                    if item.is_some() {
                        return Err(AddressParseError::ItemOutsideSection(input.to_string()));
                    }
                    None
                }
                &[entry, section] => Some(ContainerAddress::section(entry, section)),
                &[entry, section, subsection] => {
                    Some(ContainerAddress::subsection(entry, section, subsection))
                }
                &[entry, section, subsection, subsubsection] => Some(
                    ContainerAddress::subsubsection(entry, section, subsection, subsubsection),
                ),
                _ => return Err(AddressParseError::TooDeep(input.to_string())),
            };

            let node = match (container, item) {
                (None, _) => NodeAddress::entry(indices[0]),
                (Some(container), None) => container.into(),
                (Some(container), Some(item)) => container.item(item),
            };
            Ok(match separator {
                Some(()) => Address::Separator(node),
                None => Address::Node(node),
            })
        }
    }

    impl FromStr for NodeAddress {
        type Err = AddressParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.parse::<Address>()? {
                Address::Node(node) => Ok(node),
                Address::Separator(_) => Err(AddressParseError::Syntax(s.trim().to_string())),
            }
        }
    }

    /* ------------------------------ Resolution ------------------------------ */

    /// Borrowed view of any node in the tree.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum NodeRef<'a> {
        Entry(&'a TopLevelEntry),
        Section(&'a Section),
        SubSection(&'a SubSection),
        SubSubSection(&'a SubSubSection),
        Item(&'a ItemEntry),
        Separator(&'a Separator),
    }

    impl<'a> NodeRef<'a> {
        pub fn date(self) -> Option<&'a str> {
            match self {
                NodeRef::Entry(n) => n.date(),
                NodeRef::Section(n) => n.date(),
                NodeRef::SubSection(n) => n.date(),
                NodeRef::SubSubSection(n) => n.date(),
                NodeRef::Item(n) => n.date(),
                NodeRef::Separator(s) => s.date.as_deref(),
            }
        }

        pub fn remark(self) -> Option<&'a str> {
            match self {
                NodeRef::Entry(n) => n.remark(),
                NodeRef::Section(n) => n.remark(),
                NodeRef::SubSection(n) => n.remark(),
                NodeRef::SubSubSection(n) => n.remark(),
                NodeRef::Item(n) => n.remark(),
                NodeRef::Separator(_) => None,
            }
        }

        pub fn separator_after(self) -> Option<&'a Separator> {
            match self {
                NodeRef::Entry(n) => n.separator_after(),
                NodeRef::Section(n) => n.separator_after(),
                NodeRef::SubSection(n) => n.separator_after(),
                NodeRef::SubSubSection(n) => n.separator_after(),
                NodeRef::Item(n) => n.separator_after(),
                NodeRef::Separator(_) => None,
            }
        }

        /// Title, name, or separator text.
        pub fn heading(self) -> &'a str {
            match self {
                NodeRef::Entry(n) => &n.title,
                NodeRef::Section(n) => &n.name,
                NodeRef::SubSection(n) => &n.name,
                NodeRef::SubSubSection(n) => &n.name,
                NodeRef::Item(n) => n.title(),
                NodeRef::Separator(s) => &s.content,
            }
        }
    }

    /// What a node lives directly inside.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Parent<'a> {
        Document(&'a Document),
        Node(NodeRef<'a>),
    }

    /// Key to replace or remove a node within its parent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Slot {
        Index(usize),
        SeparatorAfter,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Lookup<'a> {
        /// `None` only when a separator address points at a node without one.
        pub node: Option<NodeRef<'a>>,
        pub parent: Parent<'a>,
        pub key: Slot,
    }

    pub fn resolve<'a>(doc: &'a Document, address: &Address) -> Option<Lookup<'a>> {
        match *address {
            Address::Node(node) => {
                let found = resolve_node(doc, node)?;
                let parent = match node.parent() {
                    Some(parent) => Parent::Node(resolve_node(doc, parent)?),
                    None => Parent::Document(doc),
                };
                Some(Lookup {
                    node: Some(found),
                    parent,
                    key: Slot::Index(node.index()),
                })
            }
            Address::Separator(owner) => {
                let owner = resolve_node(doc, owner)?;
                Some(Lookup {
                    node: owner.separator_after().map(NodeRef::Separator),
                    parent: Parent::Node(owner),
                    key: Slot::SeparatorAfter,
                })
            }
        }
    }

    pub fn resolve_node(doc: &Document, node: NodeAddress) -> Option<NodeRef<'_>> {
        match node {
            NodeAddress::Entry { entry } => doc.entries.get(entry).map(|e| NodeRef::Entry(e)),
            NodeAddress::Section { entry, section } => {
                section_at(doc, entry, section).map(NodeRef::Section)
            }
            NodeAddress::SubSection {
                entry,
                section,
                subsection,
            } => subsection_at(doc, entry, section, subsection).map(NodeRef::SubSection),
            NodeAddress::SubSubSection {
                entry,
                section,
                subsection,
                subsubsection,
            } => subsubsection_at(doc, entry, section, subsection, subsubsection)
                .map(NodeRef::SubSubSection),
            NodeAddress::Item { container, item } => items_at(doc, container)?
                .get(item)
                .map(|i| NodeRef::Item(i)),
        }
    }

    pub fn items_at(doc: &Document, container: ContainerAddress) -> Option<&[Arc<ItemEntry>]> {
        match container {
            ContainerAddress::Section { entry, section } => {
                section_at(doc, entry, section).map(|s| s.items.as_slice())
            }
            ContainerAddress::SubSection {
                entry,
                section,
                subsection,
            } => subsection_at(doc, entry, section, subsection).map(|s| s.items.as_slice()),
            ContainerAddress::SubSubSection {
                entry,
                section,
                subsection,
                subsubsection,
            } => subsubsection_at(doc, entry, section, subsection, subsubsection)
                .map(|s| s.items.as_slice()),
        }
    }

    /// Length of the collection the addressed node lives in.
    pub(crate) fn sibling_count(doc: &Document, node: NodeAddress) -> Option<usize> {
        match node {
            NodeAddress::Entry { .. } => Some(doc.entries.len()),
            NodeAddress::Section { entry, .. } => doc.entries.get(entry).map(|e| e.sections.len()),
            NodeAddress::SubSection { entry, section, .. } => {
                section_at(doc, entry, section).map(|s| s.subsections.len())
            }
            NodeAddress::SubSubSection {
                entry,
                section,
                subsection,
                ..
            } => subsection_at(doc, entry, section, subsection).map(|s| s.subsubsections.len()),
            NodeAddress::Item { container, .. } => items_at(doc, container).map(<[_]>::len),
        }
    }

    fn section_at(doc: &Document, entry: usize, section: usize) -> Option<&Section> {
        doc.entries.get(entry)?.sections.get(section).map(|s| s.as_ref())
    }

    fn subsection_at(
        doc: &Document,
        entry: usize,
        section: usize,
        subsection: usize,
    ) -> Option<&SubSection> {
        section_at(doc, entry, section)?
            .subsections
            .get(subsection)
            .map(|s| s.as_ref())
    }

    fn subsubsection_at(
        doc: &Document,
        entry: usize,
        section: usize,
        subsection: usize,
        subsubsection: usize,
    ) -> Option<&SubSubSection> {
        subsection_at(doc, entry, section, subsection)?
            .subsubsections
            .get(subsubsection)
            .map(|s| s.as_ref())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::testing::sample;

        #[test]
        fn textual_form_round_trips() {
            for text in ["0", "1.2", "0.1.2", "0.1.2.3", "0.1#4", "0.1.2.3#0", "2/sep", "0.1#4/sep"] {
                let address: Address = text.parse().expect("parse");
                assert_eq!(address.to_string(), text);
            }
        }

        #[test]
        fn textual_form_rejects_bad_shapes() {
            assert!(matches!("0#1".parse::<Address>(), Err(AddressParseError::ItemOutsideSection(_))));
            assert!(matches!("0.1.2.3.4".parse::<Address>(), Err(AddressParseError::TooDeep(_))));
            assert!(matches!("a.b".parse::<Address>(), Err(AddressParseError::Syntax(_))));
            assert!(matches!("0.1/sep".parse::<NodeAddress>(), Err(AddressParseError::Syntax(_))));
        }

        #[test]
        fn resolves_item_with_parent_and_index() {
            let doc = sample();
            let address = Address::Node(ContainerAddress::section(0, 0).item(1));
            let lookup = resolve(&doc, &address).expect("resolve");
            assert_eq!(lookup.key, Slot::Index(1));
            assert_eq!(lookup.node.map(NodeRef::heading), Some("Solve"));
            match lookup.parent {
                Parent::Node(NodeRef::Section(section)) => assert_eq!(section.name, "Equations"),
                other => panic!("unexpected parent {other:?}"),
            }
        }

        #[test]
        fn entry_parent_is_document() {
            let doc = sample();
            let lookup = resolve(&doc, &NodeAddress::entry(1).into()).expect("resolve");
            assert!(matches!(lookup.parent, Parent::Document(_)));
        }

        #[test]
        fn separator_lookup_reports_absent_value_with_owner() {
            let doc = sample();
            let present = resolve(&doc, &ContainerAddress::section(0, 0).item(1).separator())
                .expect("owner exists");
            assert_eq!(present.key, Slot::SeparatorAfter);
            assert_eq!(present.node.map(NodeRef::heading), Some("Holidays"));

            let absent = resolve(&doc, &NodeAddress::entry(0).separator()).expect("owner exists");
            assert!(absent.node.is_none());
            assert!(matches!(absent.parent, Parent::Node(NodeRef::Entry(_))));
        }

        #[test]
        fn misses_return_none_instead_of_panicking() {
            let doc = sample();
            for text in ["9", "0.9", "0.0.9", "0.0.0.9", "0.0#9", "1.0", "9/sep"] {
                let address: Address = text.parse().expect("parse");
                assert!(resolve(&doc, &address).is_none(), "{text}");
            }
        }
    }
}

pub mod mutations {
    //! Structural edits.
    //!
    //! Each operation reads one snapshot and returns the next. Only the chain of nodes
    //! from the root down to the edit is cloned (`Arc::make_mut`); siblings stay shared,
    //! so the input snapshot is never observably changed. A stale address is a no-op
    //! reported through [`Edit::Unchanged`], never a panic.

    use crate::address::*;
    use crate::core::*;
    use std::{fmt, str::FromStr, sync::Arc};

    /* ------------------------------ Outcomes ------------------------------ */

    #[must_use]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Edit {
        Changed(Document),
        Unchanged(Miss),
    }

    impl Edit {
        pub fn is_changed(&self) -> bool {
            matches!(self, Edit::Changed(_))
        }

        pub fn into_document(self) -> Option<Document> {
            match self {
                Edit::Changed(doc) => Some(doc),
                Edit::Unchanged(_) => None,
            }
        }
    }

    /// Why an edit left the document untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum Miss {
        #[error("address not found")]
        AddressNotFound,
        #[error("target cannot hold or carry that")]
        CapabilityMismatch,
        #[error("nothing to remove")]
        NothingToRemove,
        #[error("already at the edge of its collection")]
        AtBoundary,
        #[error("value not accepted for this field")]
        InvalidValue,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("a separator is already attached after {0}")]
        AttachmentConflict(NodeAddress),
    }

    /// Anything a history mutation closure may hand back.
    pub trait IntoEdit {
        fn into_edit(self) -> Result<Edit, EditError>;
    }

    impl IntoEdit for Edit {
        fn into_edit(self) -> Result<Edit, EditError> {
            Ok(self)
        }
    }

    impl IntoEdit for Result<Edit, EditError> {
        fn into_edit(self) -> Result<Edit, EditError> {
            self
        }
    }

    impl IntoEdit for Document {
        fn into_edit(self) -> Result<Edit, EditError> {
            Ok(Edit::Changed(self))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Up,
        Down,
    }

    /// Editable attributes. Which ones a node carries depends on its kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Field {
        /// `title` on entries and items, `name` on sections.
        Title,
        Date,
        Remark,
        Type,
        Number,
        Description,
        Page,
        /// Separator text.
        Content,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown field {0:?}")]
    pub struct UnknownField(pub String);

    impl FromStr for Field {
        type Err = UnknownField;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(match s.trim().to_ascii_lowercase().as_str() {
                "title" | "name" => Field::Title,
                "date" => Field::Date,
                "remark" => Field::Remark,
                "type" | "kind" => Field::Type,
                "number" => Field::Number,
                "description" => Field::Description,
                "page" => Field::Page,
                "content" => Field::Content,
                _ => return Err(UnknownField(s.to_string())),
            })
        }
    }

    fn skip(op: &'static str, at: impl fmt::Display, miss: Miss) -> Edit {
        tracing::debug!(op, at = %at, %miss, "edit skipped");
        Edit::Unchanged(miss)
    }

    /// Explains a miss on a node that is not of the expected depth.
    fn miss_for(doc: &Document, at: NodeAddress) -> Miss {
        match resolve_node(doc, at) {
            Some(_) => Miss::CapabilityMismatch,
            None => Miss::AddressNotFound,
        }
    }

    fn slot_after(after: Option<usize>, len: usize, when_omitted: usize) -> usize {
        after.map_or(when_omitted, |i| i.saturating_add(1).min(len))
    }

    /* -------------------------- Copy-on-write path -------------------------- */

    fn entry_mut(doc: &mut Document, entry: usize) -> Option<&mut TopLevelEntry> {
        doc.entries.get_mut(entry).map(Arc::make_mut)
    }

    fn section_mut(doc: &mut Document, entry: usize, section: usize) -> Option<&mut Section> {
        entry_mut(doc, entry)?
            .sections
            .get_mut(section)
            .map(Arc::make_mut)
    }

    fn subsection_mut(
        doc: &mut Document,
        entry: usize,
        section: usize,
        subsection: usize,
    ) -> Option<&mut SubSection> {
        section_mut(doc, entry, section)?
            .subsections
            .get_mut(subsection)
            .map(Arc::make_mut)
    }

    fn subsubsection_mut(
        doc: &mut Document,
        entry: usize,
        section: usize,
        subsection: usize,
        subsubsection: usize,
    ) -> Option<&mut SubSubSection> {
        subsection_mut(doc, entry, section, subsection)?
            .subsubsections
            .get_mut(subsubsection)
            .map(Arc::make_mut)
    }

    fn items_mut(
        doc: &mut Document,
        container: ContainerAddress,
    ) -> Option<&mut Vec<Arc<ItemEntry>>> {
        match container {
            ContainerAddress::Section { entry, section } => {
                section_mut(doc, entry, section).map(|s| &mut s.items)
            }
            ContainerAddress::SubSection {
                entry,
                section,
                subsection,
            } => subsection_mut(doc, entry, section, subsection).map(|s| &mut s.items),
            ContainerAddress::SubSubSection {
                entry,
                section,
                subsection,
                subsubsection,
            } => subsubsection_mut(doc, entry, section, subsection, subsubsection)
                .map(|s| &mut s.items),
        }
    }

    enum NodeMut<'a> {
        Entry(&'a mut TopLevelEntry),
        Section(&'a mut Section),
        SubSection(&'a mut SubSection),
        SubSubSection(&'a mut SubSubSection),
        Item(&'a mut ItemEntry),
    }

    impl<'a> NodeMut<'a> {
        fn into_annotated(self) -> &'a mut dyn Annotated {
            match self {
                NodeMut::Entry(n) => n,
                NodeMut::Section(n) => n,
                NodeMut::SubSection(n) => n,
                NodeMut::SubSubSection(n) => n,
                NodeMut::Item(n) => n,
            }
        }
    }

    fn node_mut(doc: &mut Document, node: NodeAddress) -> Option<NodeMut<'_>> {
        match node {
            NodeAddress::Entry { entry } => entry_mut(doc, entry).map(NodeMut::Entry),
            NodeAddress::Section { entry, section } => {
                section_mut(doc, entry, section).map(NodeMut::Section)
            }
            NodeAddress::SubSection {
                entry,
                section,
                subsection,
            } => subsection_mut(doc, entry, section, subsection).map(NodeMut::SubSection),
            NodeAddress::SubSubSection {
                entry,
                section,
                subsection,
                subsubsection,
            } => subsubsection_mut(doc, entry, section, subsection, subsubsection)
                .map(NodeMut::SubSubSection),
            NodeAddress::Item { container, item } => items_mut(doc, container)?
                .get_mut(item)
                .map(|i| NodeMut::Item(Arc::make_mut(i))),
        }
    }

    /// The collection a node lives in, borrowed for splicing.
    enum Siblings<'a> {
        Entries(&'a mut Vec<Arc<TopLevelEntry>>),
        Sections(&'a mut Vec<Arc<Section>>),
        SubSections(&'a mut Vec<Arc<SubSection>>),
        SubSubSections(&'a mut Vec<Arc<SubSubSection>>),
        Items(&'a mut Vec<Arc<ItemEntry>>),
    }

    impl Siblings<'_> {
        fn remove(&mut self, index: usize) {
            match self {
                Siblings::Entries(v) => drop(v.remove(index)),
                Siblings::Sections(v) => drop(v.remove(index)),
                Siblings::SubSections(v) => drop(v.remove(index)),
                Siblings::SubSubSections(v) => drop(v.remove(index)),
                Siblings::Items(v) => drop(v.remove(index)),
            }
        }

        fn swap(&mut self, a: usize, b: usize) {
            match self {
                Siblings::Entries(v) => v.swap(a, b),
                Siblings::Sections(v) => v.swap(a, b),
                Siblings::SubSections(v) => v.swap(a, b),
                Siblings::SubSubSections(v) => v.swap(a, b),
                Siblings::Items(v) => v.swap(a, b),
            }
        }
    }

    fn siblings_mut(doc: &mut Document, node: NodeAddress) -> Option<Siblings<'_>> {
        Some(match node {
            NodeAddress::Entry { .. } => Siblings::Entries(&mut doc.entries),
            NodeAddress::Section { entry, .. } => {
                Siblings::Sections(&mut entry_mut(doc, entry)?.sections)
            }
            NodeAddress::SubSection { entry, section, .. } => {
                Siblings::SubSections(&mut section_mut(doc, entry, section)?.subsections)
            }
            NodeAddress::SubSubSection {
                entry,
                section,
                subsection,
                ..
            } => Siblings::SubSubSections(
                &mut subsection_mut(doc, entry, section, subsection)?.subsubsections,
            ),
            NodeAddress::Item { container, .. } => Siblings::Items(items_mut(doc, container)?),
        })
    }

    /* ------------------------------ Inserts ------------------------------ */

    /// Inserts after `after`, or appends when omitted.
    pub fn insert_entry(doc: &Document, entry: TopLevelEntry, after: Option<usize>) -> Edit {
        let mut next = doc.clone();
        let len = next.entries.len();
        next.entries.insert(slot_after(after, len, len), Arc::new(entry));
        Edit::Changed(next)
    }

    /// `parent` must address an entry whose kind supports sections. Appends when `after` is omitted.
    pub fn insert_section(
        doc: &Document,
        parent: NodeAddress,
        section: Section,
        after: Option<usize>,
    ) -> Edit {
        const OP: &str = "insert_section";
        let NodeAddress::Entry { entry } = parent else {
            return skip(OP, parent, miss_for(doc, parent));
        };
        let Some(owner) = doc.entries.get(entry) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        if !owner.kind.supports_sections() {
            return skip(OP, parent, Miss::CapabilityMismatch);
        }
        let len = owner.sections.len();
        let mut next = doc.clone();
        let Some(owner) = entry_mut(&mut next, entry) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        owner
            .sections
            .insert(slot_after(after, len, len), Arc::new(section));
        Edit::Changed(next)
    }

    /// `parent` must address a section. Appends when `after` is omitted.
    pub fn insert_subsection(
        doc: &Document,
        parent: NodeAddress,
        subsection: SubSection,
        after: Option<usize>,
    ) -> Edit {
        const OP: &str = "insert_subsection";
        let NodeAddress::Section { entry, section } = parent else {
            return skip(OP, parent, miss_for(doc, parent));
        };
        let Some(len) = resolve_node(doc, parent).and_then(|node| match node {
            NodeRef::Section(s) => Some(s.subsections.len()),
            _ => None,
        }) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        let mut next = doc.clone();
        let Some(owner) = section_mut(&mut next, entry, section) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        owner
            .subsections
            .insert(slot_after(after, len, len), Arc::new(subsection));
        Edit::Changed(next)
    }

    /// `parent` must address a subsection. Appends when `after` is omitted.
    pub fn insert_subsubsection(
        doc: &Document,
        parent: NodeAddress,
        subsubsection: SubSubSection,
        after: Option<usize>,
    ) -> Edit {
        const OP: &str = "insert_subsubsection";
        let NodeAddress::SubSection {
            entry,
            section,
            subsection,
        } = parent
        else {
            return skip(OP, parent, miss_for(doc, parent));
        };
        let Some(len) = resolve_node(doc, parent).and_then(|node| match node {
            NodeRef::SubSection(s) => Some(s.subsubsections.len()),
            _ => None,
        }) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        let mut next = doc.clone();
        let Some(owner) = subsection_mut(&mut next, entry, section, subsection) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        owner
            .subsubsections
            .insert(slot_after(after, len, len), Arc::new(subsubsection));
        Edit::Changed(next)
    }

    /// `parent` must own an `items` collection. Unlike the other inserts, an omitted
    /// `after` prepends.
    pub fn insert_item(
        doc: &Document,
        parent: NodeAddress,
        item: impl Into<ItemEntry>,
        after: Option<usize>,
    ) -> Edit {
        const OP: &str = "insert_item";
        let Some(container) = parent.as_container() else {
            return skip(OP, parent, miss_for(doc, parent));
        };
        let Some(len) = items_at(doc, container).map(<[_]>::len) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        let mut next = doc.clone();
        let Some(items) = items_mut(&mut next, container) else {
            return skip(OP, parent, Miss::AddressNotFound);
        };
        items.insert(slot_after(after, len, 0), Arc::new(item.into()));
        Edit::Changed(next)
    }

    /* ----------------------------- Separators ----------------------------- */

    /// Refuses to overwrite an existing separator.
    pub fn attach_separator(
        doc: &Document,
        node: NodeAddress,
        separator: Separator,
    ) -> Result<Edit, EditError> {
        const OP: &str = "attach_separator";
        let Some(found) = resolve_node(doc, node) else {
            return Ok(skip(OP, node, Miss::AddressNotFound));
        };
        if found.separator_after().is_some() {
            tracing::warn!(at = %node, "separator already attached");
            return Err(EditError::AttachmentConflict(node));
        }
        let mut next = doc.clone();
        let Some(target) = node_mut(&mut next, node) else {
            return Ok(skip(OP, node, Miss::AddressNotFound));
        };
        *target.into_annotated().separator_slot() = Some(separator);
        Ok(Edit::Changed(next))
    }

    pub fn delete_separator(doc: &Document, node: NodeAddress) -> Edit {
        const OP: &str = "delete_separator";
        let Some(found) = resolve_node(doc, node) else {
            return skip(OP, node, Miss::AddressNotFound);
        };
        if found.separator_after().is_none() {
            return skip(OP, node, Miss::NothingToRemove);
        }
        let mut next = doc.clone();
        let Some(target) = node_mut(&mut next, node) else {
            return skip(OP, node, Miss::AddressNotFound);
        };
        *target.into_annotated().separator_slot() = None;
        Edit::Changed(next)
    }

    /* ------------------------- Delete / move / update ------------------------- */

    /// Removes the addressed node (with its subtree) or the addressed separator.
    pub fn delete_node(doc: &Document, address: &Address) -> Edit {
        const OP: &str = "delete_node";
        let node = match *address {
            Address::Separator(owner) => return delete_separator(doc, owner),
            Address::Node(node) => node,
        };
        if resolve_node(doc, node).is_none() {
            return skip(OP, node, Miss::AddressNotFound);
        }
        let mut next = doc.clone();
        let Some(mut siblings) = siblings_mut(&mut next, node) else {
            return skip(OP, node, Miss::AddressNotFound);
        };
        siblings.remove(node.index());
        Edit::Changed(next)
    }

    /// Swaps the node with its previous or next sibling.
    pub fn move_node(doc: &Document, node: NodeAddress, direction: Direction) -> Edit {
        const OP: &str = "move_node";
        let from = node.index();
        let Some(len) = sibling_count(doc, node).filter(|&len| from < len) else {
            return skip(OP, node, Miss::AddressNotFound);
        };
        let to = match direction {
            Direction::Up => from.checked_sub(1),
            Direction::Down => Some(from + 1).filter(|&to| to < len),
        };
        let Some(to) = to else {
            return skip(OP, node, Miss::AtBoundary);
        };
        let mut next = doc.clone();
        let Some(mut siblings) = siblings_mut(&mut next, node) else {
            return skip(OP, node, Miss::AddressNotFound);
        };
        siblings.swap(from, to);
        Edit::Changed(next)
    }

    /// Sets one attribute. An empty value clears optional attributes.
    pub fn update_field(doc: &Document, address: &Address, field: Field, value: &str) -> Edit {
        const OP: &str = "update_field";
        match resolve(doc, address) {
            Some(Lookup { node: Some(_), .. }) => {}
            _ => return skip(OP, address, Miss::AddressNotFound),
        }
        let mut next = doc.clone();
        let outcome = match *address {
            Address::Node(node) => match node_mut(&mut next, node) {
                Some(target) => set_node_field(target, field, value),
                None => Err(Miss::AddressNotFound),
            },
            Address::Separator(owner) => match node_mut(&mut next, owner) {
                Some(target) => match target.into_annotated().separator_slot() {
                    Some(separator) => set_separator_field(separator, field, value),
                    None => Err(Miss::AddressNotFound),
                },
                None => Err(Miss::AddressNotFound),
            },
        };
        match outcome {
            Ok(()) => Edit::Changed(next),
            Err(miss) => skip(OP, address, miss),
        }
    }

    fn optional(value: &str) -> Option<String> {
        (!value.trim().is_empty()).then(|| value.to_string())
    }

    fn set_node_field(node: NodeMut<'_>, field: Field, value: &str) -> Result<(), Miss> {
        match (node, field) {
            (node, Field::Date) => *node.into_annotated().date_slot() = optional(value),
            (node, Field::Remark) => *node.into_annotated().remark_slot() = optional(value),
            (NodeMut::Item(item), field) => return set_item_field(item, field, value),
            (NodeMut::Entry(entry), Field::Title) => entry.title = value.to_string(),
            (NodeMut::Entry(entry), Field::Type) => {
                entry.kind = EntryKind::parse(value).ok_or(Miss::InvalidValue)?;
                entry.unrecognized_kind = None;
            }
            (NodeMut::Section(section), Field::Title) => section.name = value.to_string(),
            (NodeMut::SubSection(section), Field::Title) => section.name = value.to_string(),
            (NodeMut::SubSubSection(section), Field::Title) => section.name = value.to_string(),
            _ => return Err(Miss::CapabilityMismatch),
        }
        Ok(())
    }

    /// Item edits go through the flat wire shape so a retyped item is re-classified
    /// (an exercise retyped to a graded kind becomes an embedded entry, and back).
    fn set_item_field(item: &mut ItemEntry, field: Field, value: &str) -> Result<(), Miss> {
        if matches!(item, ItemEntry::Embedded(_))
            && matches!(field, Field::Number | Field::Description | Field::Page)
        {
            return Err(Miss::CapabilityMismatch);
        }
        let mut raw = crate::core::RawItemEntry::from(item.clone());
        match field {
            Field::Title => raw.title = optional(value),
            Field::Type => raw.kind = value.trim().to_string(),
            Field::Number => raw.number = optional(value),
            Field::Description => raw.description = optional(value),
            Field::Page => raw.page = optional(value),
            Field::Date | Field::Remark | Field::Content => return Err(Miss::CapabilityMismatch),
        }
        *item = ItemEntry::from(raw);
        Ok(())
    }

    fn set_separator_field(separator: &mut Separator, field: Field, value: &str) -> Result<(), Miss> {
        match field {
            Field::Content => separator.content = value.to_string(),
            Field::Date => separator.date = optional(value),
            _ => return Err(Miss::CapabilityMismatch),
        }
        Ok(())
    }

}

pub mod history {
    use crate::core::Document;
    use crate::mutations::{Edit, EditError, IntoEdit};

    pub const DEFAULT_CAPACITY: usize = 50;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Snapshot {
        pub label: String,
        pub document: Document,
    }

    /// Bounded list of snapshots with a cursor on the current one.
    ///
    /// Applying after an undo discards everything past the cursor. Once the list grows
    /// past `capacity` the oldest snapshot is evicted, so at most `capacity - 1` undos
    /// are ever available.
    #[derive(Debug, Clone)]
    pub struct History {
        snapshots: Vec<Snapshot>,
        cursor: usize,
        capacity: usize,
    }

    impl History {
        pub fn new(initial: Document) -> Self {
            Self::with_capacity(initial, DEFAULT_CAPACITY)
        }

        pub fn with_capacity(initial: Document, capacity: usize) -> Self {
            Self {
                snapshots: vec![Snapshot {
                    label: "initial".to_string(),
                    document: initial,
                }],
                cursor: 0,
                capacity: capacity.max(1),
            }
        }

        pub fn current(&self) -> &Document {
            &self.snapshots[self.cursor].document
        }

        /// Runs `f` against the current snapshot and records the result.
        ///
        /// Returns `Ok(false)` when nothing changed (the edit missed, or produced an
        /// equal document); history is left as it was.
        pub fn apply<F, R>(&mut self, label: impl Into<String>, f: F) -> Result<bool, EditError>
        where
            F: FnOnce(&Document) -> R,
            R: IntoEdit,
        {
            let next = match f(self.current()).into_edit()? {
                Edit::Changed(next) if next != *self.current() => next,
                Edit::Changed(_) | Edit::Unchanged(_) => return Ok(false),
            };
            self.push(label.into(), next);
            Ok(true)
        }

        fn push(&mut self, label: String, document: Document) {
            self.snapshots.truncate(self.cursor + 1);
            self.snapshots.push(Snapshot { label, document });
            if self.snapshots.len() > self.capacity {
                let overflow = self.snapshots.len() - self.capacity;
                self.snapshots.drain(..overflow);
            }
            self.cursor = self.snapshots.len() - 1;
            tracing::trace!(cursor = self.cursor, len = self.snapshots.len(), "snapshot recorded");
        }

        pub fn undo(&mut self) -> bool {
            if !self.can_undo() {
                return false;
            }
            self.cursor -= 1;
            true
        }

        pub fn redo(&mut self) -> bool {
            if !self.can_redo() {
                return false;
            }
            self.cursor += 1;
            true
        }

        pub fn can_undo(&self) -> bool {
            self.cursor > 0
        }

        pub fn can_redo(&self) -> bool {
            self.cursor + 1 < self.snapshots.len()
        }

        /// Label of the edit an undo would revert.
        pub fn undo_label(&self) -> Option<&str> {
            self.can_undo()
                .then(|| self.snapshots[self.cursor].label.as_str())
        }

        /// Label of the edit a redo would replay.
        pub fn redo_label(&self) -> Option<&str> {
            self.snapshots.get(self.cursor + 1).map(|s| s.label.as_str())
        }

        pub fn labels(&self) -> impl Iterator<Item = &str> {
            self.snapshots.iter().map(|s| s.label.as_str())
        }

        /// Starts over from `document`, dropping all snapshots.
        pub fn reset(&mut self, document: Document) {
            self.snapshots.clear();
            self.snapshots.push(Snapshot {
                label: "initial".to_string(),
                document,
            });
            self.cursor = 0;
        }

        /// Snapshots held, current one included. Never zero.
        #[allow(clippy::len_without_is_empty)]
        pub fn len(&self) -> usize {
            self.snapshots.len()
        }

        pub fn capacity(&self) -> usize {
            self.capacity
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::address::{ContainerAddress, NodeAddress};
        use crate::core::*;
        use crate::mutations::*;
        use crate::testing::sample;

        fn chapter(title: &str) -> TopLevelEntry {
            TopLevelEntry::new(EntryKind::Chapter, title)
        }

        #[test]
        fn undo_after_apply_restores_previous_snapshot() {
            let doc = sample();
            let mut history = History::new(doc.clone());
            let applied = history
                .apply("add chapter", |d| insert_entry(d, chapter("Geometry"), None))
                .expect("apply");
            assert!(applied);
            assert_ne!(*history.current(), doc);
            assert!(history.undo());
            assert_eq!(*history.current(), doc);
            assert!(history.redo());
            assert_eq!(history.current().entries.last().map(|e| e.title.as_str()), Some("Geometry"));
        }

        #[test]
        fn undo_and_redo_clamp_at_the_ends() {
            let mut history = History::new(Document::new());
            assert!(!history.undo());
            assert!(!history.redo());
            history
                .apply("one", |d| insert_entry(d, chapter("One"), None))
                .expect("apply");
            assert!(!history.redo());
            assert!(history.undo());
            assert!(!history.undo());
            assert_eq!(history.current(), &Document::new());
        }

        #[test]
        fn applying_after_undo_discards_the_future() {
            let mut history = History::new(Document::new());
            history.apply("a", |d| insert_entry(d, chapter("A"), None)).expect("a");
            history.apply("b", |d| insert_entry(d, chapter("B"), None)).expect("b");
            assert!(history.undo());
            history.apply("c", |d| insert_entry(d, chapter("C"), None)).expect("c");
            assert!(!history.can_redo());
            let titles: Vec<_> = history.current().entries.iter().map(|e| e.title.clone()).collect();
            assert_eq!(titles, ["A", "C"]);
            assert_eq!(history.labels().collect::<Vec<_>>(), ["initial", "a", "c"]);
        }

        #[test]
        fn capacity_evicts_oldest_snapshots() {
            let mut history = History::with_capacity(Document::new(), 3);
            for title in ["A", "B", "C", "D"] {
                history
                    .apply(title, |d| insert_entry(d, chapter(title), None))
                    .expect("apply");
            }
            assert_eq!(history.len(), 3);
            let mut undos = 0;
            while history.undo() {
                undos += 1;
            }
            assert_eq!(undos, 2);
            assert_eq!(history.current().len(), 2);
        }

        #[test]
        fn missed_edits_do_not_record_a_snapshot() {
            let mut history = History::new(sample());
            let applied = history
                .apply("nowhere", |d| delete_node(d, &NodeAddress::entry(9).into()))
                .expect("apply");
            assert!(!applied);
            let same = history.apply("same", |d| d.clone()).expect("apply");
            assert!(!same);
            assert_eq!(history.len(), 1);
            assert!(!history.can_undo());
        }

        #[test]
        fn noop_after_undo_keeps_the_redo_branch() {
            let mut history = History::new(Document::new());
            history.apply("a", |d| insert_entry(d, chapter("A"), None)).expect("a");
            history.apply("b", |d| insert_entry(d, chapter("B"), None)).expect("b");
            assert!(history.undo());
            let before = history.current().clone();

            let same = history.apply("same", |d| d.clone()).expect("same");
            let missed = history
                .apply("nowhere", |d| move_node(d, NodeAddress::entry(0), Direction::Up))
                .expect("missed");
            assert!(!same && !missed);
            assert_eq!(history.len(), 3);
            assert!(history.can_undo());
            assert!(history.can_redo());
            assert_eq!(history.redo_label(), Some("b"));
            assert_eq!(*history.current(), before);
            assert!(history.redo());
            assert_eq!(history.current().len(), 2);
        }

        #[test]
        fn conflicts_propagate_without_recording() {
            let mut history = History::new(sample());
            let owner = ContainerAddress::section(0, 0).item(1);
            let err = history
                .apply("separator", |d| attach_separator(d, owner, Separator::new("Again", true)))
                .expect_err("conflict");
            assert_eq!(err, EditError::AttachmentConflict(owner));
            assert_eq!(history.len(), 1);
        }

        #[test]
        fn labels_describe_undo_and_redo() {
            let mut history = History::new(Document::new());
            assert_eq!(history.undo_label(), None);
            history.apply("add A", |d| insert_entry(d, chapter("A"), None)).expect("a");
            assert_eq!(history.undo_label(), Some("add A"));
            history.undo();
            assert_eq!(history.redo_label(), Some("add A"));
            history.reset(sample());
            assert_eq!(history.len(), 1);
            assert_eq!(history.redo_label(), None);
        }

        #[test]
        fn zero_capacity_still_keeps_the_current_snapshot() {
            let mut history = History::with_capacity(Document::new(), 0);
            assert_eq!(history.capacity(), 1);
            history.apply("a", |d| insert_entry(d, chapter("A"), None)).expect("a");
            assert_eq!(history.len(), 1);
            assert_eq!(history.current().len(), 1);
            assert!(!history.can_undo());
        }
    }
}

pub mod projectors {
    pub mod flatten {
        //! Depth-first display rows, shared by the listing and any printed layout.

        use crate::address::*;
        use crate::core::*;
        use chrono::NaiveDate;
        use serde::Serialize;

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum RowKind {
            /// Top-level entry, or a graded-work entry embedded among items.
            Entry(EntryKind),
            Section,
            SubSection,
            SubSubSection,
            Item,
            Separator,
        }

        impl RowKind {
            pub fn label(self) -> &'static str {
                match self {
                    RowKind::Entry(kind) => kind.as_str(),
                    RowKind::Section => "section",
                    RowKind::SubSection => "subsection",
                    RowKind::SubSubSection => "subsubsection",
                    RowKind::Item => "item",
                    RowKind::Separator => "separator",
                }
            }
        }

        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        pub struct Row<'a> {
            pub address: Address,
            pub kind: RowKind,
            pub node: NodeRef<'a>,
        }

        impl<'a> Row<'a> {
            /// The row's own date, ignoring blanks.
            pub fn date(&self) -> Option<&'a str> {
                self.node.date().filter(|d| !d.trim().is_empty())
            }

            pub fn parsed_date(&self) -> Option<NaiveDate> {
                self.date().and_then(parse_date)
            }

            pub fn depth(&self) -> usize {
                match self.address.node() {
                    NodeAddress::Entry { .. } => 0,
                    NodeAddress::Section { .. } => 1,
                    NodeAddress::SubSection { .. } => 2,
                    NodeAddress::SubSubSection { .. } => 3,
                    NodeAddress::Item { container, .. } => match container {
                        ContainerAddress::Section { .. } => 2,
                        ContainerAddress::SubSection { .. } => 3,
                        ContainerAddress::SubSubSection { .. } => 4,
                    },
                }
            }
        }

        struct Rows<'a> {
            rows: Vec<Row<'a>>,
        }

        impl<'a> Rows<'a> {
            fn emit(&mut self, at: NodeAddress, kind: RowKind, node: NodeRef<'a>) {
                self.rows.push(Row {
                    address: Address::Node(at),
                    kind,
                    node,
                });
                if let Some(separator) = node.separator_after() {
                    self.rows.push(Row {
                        address: Address::Separator(at),
                        kind: RowKind::Separator,
                        node: NodeRef::Separator(separator),
                    });
                }
            }

            fn items(&mut self, container: ContainerAddress, items: &'a [std::sync::Arc<ItemEntry>]) {
                for (i, item) in items.iter().enumerate() {
                    let kind = item.entry_kind().map_or(RowKind::Item, RowKind::Entry);
                    self.emit(container.item(i), kind, NodeRef::Item(item));
                }
            }
        }

        /// Every node in document order, each followed by its separator row if it has one.
        /// Subsections are visited before a section's own items.
        pub fn flatten(doc: &Document) -> Vec<Row<'_>> {
            let mut out = Rows { rows: Vec::new() };
            for (e, entry) in doc.entries.iter().enumerate() {
                out.emit(NodeAddress::entry(e), RowKind::Entry(entry.kind), NodeRef::Entry(entry));
                for (s, section) in entry.sections.iter().enumerate() {
                    out.emit(NodeAddress::section(e, s), RowKind::Section, NodeRef::Section(section));
                    for (ss, sub) in section.subsections.iter().enumerate() {
                        out.emit(
                            NodeAddress::subsection(e, s, ss),
                            RowKind::SubSection,
                            NodeRef::SubSection(sub),
                        );
                        for (sss, subsub) in sub.subsubsections.iter().enumerate() {
                            out.emit(
                                NodeAddress::subsubsection(e, s, ss, sss),
                                RowKind::SubSubSection,
                                NodeRef::SubSubSection(subsub),
                            );
                            out.items(ContainerAddress::subsubsection(e, s, ss, sss), &subsub.items);
                        }
                        out.items(ContainerAddress::subsection(e, s, ss), &sub.items);
                    }
                    out.items(ContainerAddress::section(e, s), &section.items);
                }
            }
            out.rows
        }

        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct GroupedRow<'a> {
            #[serde(flatten)]
            pub row: Row<'a>,
            pub starts_date_group: bool,
        }

        /// Marks each dated row whose date differs from the last non-empty date seen.
        /// Separator rows are skipped and never start a group.
        pub fn group_by_date(rows: Vec<Row<'_>>) -> Vec<GroupedRow<'_>> {
            let starts = date_group_starts(rows.iter().map(|row| match row.kind {
                RowKind::Separator => None,
                _ => row.date(),
            }));
            rows.into_iter()
                .zip(starts)
                .map(|(row, starts_date_group)| GroupedRow {
                    row,
                    starts_date_group,
                })
                .collect()
        }

        /// The boundary pass on its own: `None` and blank dates never start a group and
        /// leave the last-seen date alone.
        pub fn date_group_starts<'d>(dates: impl IntoIterator<Item = Option<&'d str>>) -> Vec<bool> {
            let mut last: Option<&str> = None;
            dates
                .into_iter()
                .map(|date| match date.filter(|d| !d.trim().is_empty()) {
                    Some(d) if last != Some(d) => {
                        last = Some(d);
                        true
                    }
                    _ => false,
                })
                .collect()
        }

    }

    pub mod search {
        //! Relevance filter over the nested document. Runs before flattening.

        use crate::core::*;
        use std::sync::Arc;

        struct Query(String);

        impl Query {
            fn hit<'a>(&self, fields: impl IntoIterator<Item = Option<&'a str>>) -> bool {
                fields
                    .into_iter()
                    .flatten()
                    .any(|text| text.to_lowercase().contains(&self.0))
            }

            fn separator(&self, separator: Option<&Separator>) -> bool {
                separator.is_some_and(|s| self.hit([Some(s.content.as_str()), s.date.as_deref()]))
            }
        }

        /// Keeps nodes whose own text matches `query` (case-insensitive) or that still have
        /// a matching descendant. Kept nodes carry only their filtered children.
        /// A blank query returns the document as is.
        pub fn filter_document(doc: &Document, query: &str) -> Document {
            let query = query.trim();
            if query.is_empty() {
                return doc.clone();
            }
            let query = Query(query.to_lowercase());
            Document {
                entries: doc
                    .entries
                    .iter()
                    .filter_map(|entry| entry_hit(&query, entry).map(Arc::new))
                    .collect(),
            }
        }

        fn entry_hit(q: &Query, entry: &TopLevelEntry) -> Option<TopLevelEntry> {
            let own = q.hit([
                Some(entry.title.as_str()),
                Some(entry.kind.as_str()),
                Some(entry.kind.label()),
                entry.date.as_deref(),
                entry.remark.as_deref(),
            ]) || q.separator(entry.separator_after.as_ref());
            let sections: Vec<_> = entry
                .sections
                .iter()
                .filter_map(|s| section_hit(q, s).map(Arc::new))
                .collect();
            (own || !sections.is_empty()).then(|| TopLevelEntry {
                sections,
                ..entry.clone()
            })
        }

        fn heading_hit(q: &Query, name: &str, node: &dyn Annotated) -> bool {
            q.hit([Some(name), node.date(), node.remark()]) || q.separator(node.separator_after())
        }

        fn section_hit(q: &Query, section: &Section) -> Option<Section> {
            let own = heading_hit(q, &section.name, section);
            let subsections: Vec<_> = section
                .subsections
                .iter()
                .filter_map(|s| subsection_hit(q, s).map(Arc::new))
                .collect();
            let items = items_hit(q, &section.items);
            (own || !subsections.is_empty() || !items.is_empty()).then(|| Section {
                subsections,
                items,
                ..section.clone()
            })
        }

        fn subsection_hit(q: &Query, sub: &SubSection) -> Option<SubSection> {
            let own = heading_hit(q, &sub.name, sub);
            let subsubsections: Vec<_> = sub
                .subsubsections
                .iter()
                .filter_map(|s| {
                    let items = items_hit(q, &s.items);
                    (heading_hit(q, &s.name, &**s) || !items.is_empty())
                        .then(|| Arc::new(SubSubSection { items, ..(**s).clone() }))
                })
                .collect();
            let items = items_hit(q, &sub.items);
            (own || !subsubsections.is_empty() || !items.is_empty()).then(|| SubSection {
                subsubsections,
                items,
                ..sub.clone()
            })
        }

        fn items_hit(q: &Query, items: &[Arc<ItemEntry>]) -> Vec<Arc<ItemEntry>> {
            items
                .iter()
                .filter(|item| {
                    let text = match &***item {
                        ItemEntry::Item(i) => q.hit([
                            Some(i.kind.as_str()),
                            i.number.as_deref(),
                            i.title.as_deref(),
                            i.description.as_deref(),
                            i.page.as_deref(),
                        ]),
                        ItemEntry::Embedded(e) => {
                            q.hit([Some(e.title.as_str()), Some(e.kind.as_str()), Some(e.kind.label())])
                        }
                    };
                    text || q.hit([item.date(), item.remark()]) || q.separator(item.separator_after())
                })
                .cloned()
                .collect()
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::projectors::flatten::flatten;
            use crate::testing::sample;

            fn headings(doc: &Document) -> Vec<String> {
                flatten(doc).iter().map(|r| r.node.heading().to_string()).collect()
            }

            #[test]
            fn blank_query_keeps_everything() {
                let doc = sample();
                assert_eq!(filter_document(&doc, "  "), doc);
            }

            #[test]
            fn deep_match_keeps_its_ancestors_only() {
                let doc = sample();
                let filtered = filter_document(&doc, "SUBSTITUTE");
                assert_eq!(headings(&filtered), ["Algebra", "Equations", "Systems", "Substitution", "Substitute"]);
            }

            #[test]
            fn matching_parent_keeps_only_matching_children() {
                let doc = sample();
                let filtered = filter_document(&doc, "equation");
                assert_eq!(headings(&filtered), ["Algebra", "Equations", "Linear equation"]);
            }

            #[test]
            fn separator_text_counts_as_a_match() {
                let doc = sample();
                let filtered = filter_document(&doc, "holidays");
                assert_eq!(headings(&filtered), ["Algebra", "Equations", "Solve", "Holidays"]);
            }

            #[test]
            fn french_kind_labels_match_entries() {
                let doc = sample();
                let filtered = filter_document(&doc, "devoir maison");
                assert_eq!(headings(&filtered), ["DM 1"]);
                assert!(filter_document(&doc, "zzz").is_empty());
            }
        }
    }
}

pub mod migrate {
    //! Load-time normalisation of stored or imported logs.
    //!
    //! Older logs stored the entry title under `chapter` and sometimes omitted the kind
    //! altogether. Both are repaired here, before the typed model sees the data, along
    //! with loosely typed fields. Only a non-array document or a non-object entry is
    //! refused; everything else loads and is left for `validate` to report.

    use crate::core::{Document, EntryKind, TopLevelEntry};
    use serde_json::{Map, Value};
    use std::sync::Arc;

    pub const LEGACY_TITLE_KEY: &str = "chapter";
    pub const UNRECOGNIZED_KIND_KEY: &str = "unrecognizedType";

    const TEXT_FIELDS: [&str; 10] = [
        "type",
        "kind",
        "title",
        "name",
        "date",
        "remark",
        "number",
        "description",
        "page",
        "content",
    ];
    const CHILD_LISTS: [&str; 4] = ["sections", "subsections", "subsubsections", "items"];

    #[derive(Debug, thiserror::Error)]
    pub enum MigrationError {
        #[error("invalid JSON: {0}")]
        Json(#[from] serde_json::Error),
        #[error("expected an array of entries, found {found}")]
        NotAnArray { found: &'static str },
        #[error("entry {index} is not an object")]
        EntryNotObject { index: usize },
        #[error("entry {index} has an unexpected shape: {source}")]
        Shape {
            index: usize,
            #[source]
            source: serde_json::Error,
        },
    }

    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => "an object",
        }
    }

    /// Scalars become their text, `null` and containers are dropped.
    fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Coerces text fields, the separator and child lists of any node, recursively.
    fn normalise_node(node: &mut Map<String, Value>) {
        if node.get("type").is_some_and(|v| !v.is_null()) {
            node.remove("kind");
        }
        for key in TEXT_FIELDS {
            let fixed = match node.get(key) {
                None | Some(Value::String(_)) => continue,
                Some(other) => scalar_text(other),
            };
            match fixed {
                Some(text) => {
                    node.insert(key.to_string(), Value::String(text));
                }
                None => {
                    node.remove(key);
                }
            }
        }

        let separator_ok = match node.get_mut("separatorAfter") {
            None => true,
            Some(Value::Object(separator)) => {
                normalise_node(separator);
                if !matches!(separator.get("manual"), None | Some(Value::Bool(_))) {
                    separator.remove("manual");
                }
                true
            }
            Some(_) => false,
        };
        if !separator_ok {
            node.remove("separatorAfter");
        }

        for key in CHILD_LISTS {
            let list_ok = match node.get_mut(key) {
                None => true,
                Some(Value::Array(children)) => {
                    let before = children.len();
                    children.retain(Value::is_object);
                    if children.len() != before {
                        tracing::warn!(list = key, dropped = before - children.len(), "non-object children dropped");
                    }
                    for child in children.iter_mut() {
                        if let Value::Object(child) = child {
                            normalise_node(child);
                        }
                    }
                    true
                }
                Some(_) => false,
            };
            if !list_ok {
                node.remove(key);
            }
        }
    }

    fn normalise_entry(mut entry: Map<String, Value>) -> Map<String, Value> {
        if let Some(legacy) = entry.remove(LEGACY_TITLE_KEY) {
            entry.entry("title").or_insert(legacy);
        }
        if !matches!(entry.get("title"), Some(Value::String(_))) {
            entry.insert("title".into(), Value::String(String::new()));
        }

        // `type` wins over the `kind` alias; `null` counts as absent.
        let declared = entry.remove("type").filter(|v| !v.is_null());
        let aliased = entry.remove("kind").filter(|v| !v.is_null());
        let kind = match declared.or(aliased) {
            None => EntryKind::Chapter.as_str().to_string(),
            Some(Value::String(raw)) if EntryKind::parse(&raw).is_some() => raw,
            Some(other) => {
                let raw = match other {
                    Value::String(raw) => raw,
                    other => other.to_string(),
                };
                tracing::warn!(kind = %raw, "unknown entry kind, reading it as a chapter");
                entry.insert(UNRECOGNIZED_KIND_KEY.into(), Value::String(raw));
                EntryKind::Chapter.as_str().to_string()
            }
        };
        entry.insert("type".into(), Value::String(kind));

        normalise_node(&mut entry);
        if !matches!(entry.get(UNRECOGNIZED_KIND_KEY), None | Some(Value::String(_))) {
            entry.remove(UNRECOGNIZED_KIND_KEY);
        }
        entry
    }

    /// Normalises a parsed log into a [`Document`].
    pub fn migrate(value: Value) -> Result<Document, MigrationError> {
        let Value::Array(raw) = value else {
            return Err(MigrationError::NotAnArray {
                found: type_name(&value),
            });
        };
        let mut entries = Vec::with_capacity(raw.len());
        for (index, item) in raw.into_iter().enumerate() {
            let Value::Object(map) = item else {
                return Err(MigrationError::EntryNotObject { index });
            };
            let entry: TopLevelEntry = serde_json::from_value(Value::Object(normalise_entry(map)))
                .map_err(|source| MigrationError::Shape { index, source })?;
            entries.push(Arc::new(entry));
        }
        tracing::debug!(entries = entries.len(), "log migrated");
        Ok(Document { entries })
    }

    /// Like [`migrate`], but falls back to an empty log and hands back the reason.
    pub fn migrate_or_empty(value: Value) -> (Document, Option<MigrationError>) {
        match migrate(value) {
            Ok(doc) => (doc, None),
            Err(err) => {
                tracing::warn!(error = %err, "unreadable log, starting empty");
                (Document::new(), Some(err))
            }
        }
    }

    pub fn load_str(text: &str) -> Result<Document, MigrationError> {
        migrate(serde_json::from_str(text)?)
    }

    pub fn load_str_or_empty(text: &str) -> (Document, Option<MigrationError>) {
        match serde_json::from_str(text) {
            Ok(value) => migrate_or_empty(value),
            Err(err) => {
                tracing::warn!(error = %err, "unparseable log, starting empty");
                (Document::new(), Some(MigrationError::Json(err)))
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum ImportMode {
        #[default]
        Replace,
        Append,
    }

    impl std::str::FromStr for ImportMode {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "replace" => Ok(ImportMode::Replace),
                "append" => Ok(ImportMode::Append),
                other => Err(format!("unknown import mode {other:?}, expected replace or append")),
            }
        }
    }

    /// Combines an imported log with the current one.
    pub fn merge(current: &Document, incoming: Document, mode: ImportMode) -> Document {
        match mode {
            ImportMode::Replace => incoming,
            ImportMode::Append => Document {
                entries: current
                    .entries
                    .iter()
                    .cloned()
                    .chain(incoming.entries)
                    .collect(),
            },
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::address::NodeAddress;
        use crate::core::{ItemEntry, ItemType, SchemaProblem, validate};
        use serde_json::json;

        #[test]
        fn legacy_title_key_is_renamed() {
            let doc = migrate(json!([{ "chapter": "Fractions", "sections": [] }])).expect("migrate");
            assert_eq!(doc.entries[0].title, "Fractions");
            assert_eq!(doc.entries[0].kind, EntryKind::Chapter);
        }

        #[test]
        fn explicit_title_wins_over_legacy_key() {
            let doc = migrate(json!([{ "type": "chapter", "title": "New", "chapter": "Old" }]))
                .expect("migrate");
            assert_eq!(doc.entries[0].title, "New");
        }

        #[test]
        fn kind_alias_and_missing_fields_are_tolerated() {
            let doc = migrate(json!([
                { "kind": "devoir maison", "title": "DM" },
                { "type": "ds", "kind": "chapter", "title": 7 }
            ]))
            .expect("migrate");
            assert_eq!(doc.entries[0].kind, EntryKind::HomeAssignment);
            assert!(doc.entries[0].sections.is_empty());
            assert_eq!(doc.entries[1].kind, EntryKind::ContinuousAssessment);
            assert_eq!(doc.entries[1].title, "");
        }

        #[test]
        fn malformed_input_is_reported() {
            assert!(matches!(
                migrate(json!({ "title": "x" })),
                Err(MigrationError::NotAnArray { found: "an object" })
            ));
            assert!(matches!(
                migrate(json!([{ "title": "ok" }, 3])),
                Err(MigrationError::EntryNotObject { index: 1 })
            ));
            assert!(matches!(load_str("[{"), Err(MigrationError::Json(_))));
        }

        #[test]
        fn unknown_entry_kind_keeps_the_log_and_is_reported() {
            let doc = load_str(r#"[{"type":"chapter","title":"A"},{"type":"lecture","title":"B"}]"#)
                .expect("unknown kinds still load");
            assert_eq!(doc.len(), 2);
            assert_eq!(doc.entries[0].unrecognized_kind, None);
            assert_eq!(doc.entries[1].kind, EntryKind::Chapter);
            assert_eq!(doc.entries[1].unrecognized_kind.as_deref(), Some("lecture"));

            let issues = validate(&doc);
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].address, NodeAddress::entry(1));
            assert_eq!(issues[0].problem, SchemaProblem::UnknownEntryKind("lecture".into()));

            let saved = serde_json::to_string(&doc).expect("serialize");
            let reloaded = load_str(&saved).expect("reload");
            assert_eq!(reloaded.entries[1].unrecognized_kind.as_deref(), Some("lecture"));
        }

        #[test]
        fn null_kind_defaults_to_chapter() {
            let doc = migrate(json!([
                { "type": null, "title": "A" },
                { "kind": null, "title": "B" },
                { "type": null, "kind": "ds", "title": "C" }
            ]))
            .expect("migrate");
            assert_eq!(doc.entries[0].kind, EntryKind::Chapter);
            assert_eq!(doc.entries[1].kind, EntryKind::Chapter);
            assert_eq!(doc.entries[2].kind, EntryKind::ContinuousAssessment);
            assert!(validate(&doc).is_empty());
        }

        #[test]
        fn loosely_typed_nested_fields_are_coerced() {
            let doc = migrate(json!([{
                "type": "chapter",
                "title": "A",
                "date": null,
                "separatorAfter": { "content": 5, "manual": "yes" },
                "sections": [{
                    "name": null,
                    "subsections": [{ "name": 2, "subsubsections": [{ "name": "deep", "items": null }] }],
                    "items": [
                        { "type": "exercise", "title": 12, "page": 42, "number": 3 },
                        { "type": null, "kind": "exemple", "title": "Ex" },
                        "stray"
                    ]
                }]
            }]))
            .expect("migrate");
            let entry = &doc.entries[0];
            assert_eq!(entry.date, None);
            let separator = entry.separator_after.as_ref().expect("separator kept");
            assert_eq!(separator.content, "5");
            assert!(!separator.manual);

            let section = &entry.sections[0];
            assert_eq!(section.name, "");
            assert_eq!(section.subsections[0].name, "2");
            assert!(section.subsections[0].subsubsections[0].items.is_empty());
            assert_eq!(section.items.len(), 2);
            match section.items[0].as_ref() {
                ItemEntry::Item(item) => {
                    assert_eq!(item.title.as_deref(), Some("12"));
                    assert_eq!(item.page.as_deref(), Some("42"));
                    assert_eq!(item.number.as_deref(), Some("3"));
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(section.items[1].as_ref(), ItemEntry::Item(i) if i.kind == ItemType::Example));
        }

        #[test]
        fn stored_log_with_loose_fields_still_shows() {
            let (doc, err) = load_str_or_empty(
                r#"[{"type":"chapter","title":"A","sections":[{"name":"S","items":[{"type":"exercise","page":42}]}]}]"#,
            );
            assert!(err.is_none());
            assert_eq!(crate::projectors::flatten::flatten(&doc).len(), 3);
        }

        #[test]
        fn fallback_yields_empty_log_with_reason() {
            let (doc, err) = load_str_or_empty("not json");
            assert!(doc.is_empty());
            assert!(matches!(err, Some(MigrationError::Json(_))));
            let (doc, err) = migrate_or_empty(json!("text"));
            assert!(doc.is_empty());
            assert!(matches!(err, Some(MigrationError::NotAnArray { found: "a string" })));
            let (doc, err) = load_str_or_empty("[]");
            assert!(doc.is_empty() && err.is_none());
        }

        #[test]
        fn merge_replaces_or_appends() {
            let current = load_str(r#"[{"type":"chapter","title":"A"}]"#).expect("current");
            let incoming = load_str(r#"[{"type":"chapter","title":"B"}]"#).expect("incoming");
            let replaced = merge(&current, incoming.clone(), ImportMode::Replace);
            assert_eq!(replaced, incoming);
            let appended = merge(&current, incoming, ImportMode::Append);
            let titles: Vec<_> = appended.entries.iter().map(|e| e.title.as_str()).collect();
            assert_eq!(titles, ["A", "B"]);
            assert!(std::sync::Arc::ptr_eq(&appended.entries[0], &current.entries[0]));
            assert_eq!("Append".parse::<ImportMode>(), Ok(ImportMode::Append));
        }
    }
}

pub mod storage {
    use super::core::Document;
    use super::migrate::{MigrationError, load_str_or_empty};
    use anyhow::{Context, Result, bail};
    use indexmap::IndexMap;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Key/value persistence for serialized logs.
    pub trait DocumentStore {
        /// Raw blob under `key`, or `None` if nothing was stored yet.
        fn read(&self, key: &str) -> Result<Option<String>>;

        fn write(&mut self, key: &str, blob: &str) -> Result<()>;

        /// Loads and migrates the log under `key`. Unreadable content yields an empty
        /// log together with the reason, so the caller can tell the user.
        fn load(&self, key: &str) -> Result<(Document, Option<MigrationError>)> {
            Ok(match self.read(key)? {
                Some(blob) => load_str_or_empty(&blob),
                None => (Document::new(), None),
            })
        }

        fn save(&mut self, key: &str, doc: &Document) -> Result<()> {
            let blob = serde_json::to_string_pretty(doc).context("serializing log")?;
            self.write(key, &blob)
        }
    }

    fn check_key(key: &str) -> Result<()> {
        let ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !ok {
            bail!("invalid store key {key:?}");
        }
        Ok(())
    }

    /// One pretty-printed `<key>.json` per log under `root`.
    #[derive(Debug, Clone)]
    pub struct FileStore {
        root: PathBuf,
    }

    impl FileStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn path_for(&self, key: &str) -> Result<PathBuf> {
            check_key(key)?;
            Ok(self.root.join(format!("{key}.json")))
        }
    }

    impl DocumentStore for FileStore {
        fn read(&self, key: &str) -> Result<Option<String>> {
            let path = self.path_for(key)?;
            if !path.exists() {
                return Ok(None);
            }
            fs::read_to_string(&path)
                .map(Some)
                .with_context(|| format!("reading {:?}", path))
        }

        fn write(&mut self, key: &str, blob: &str) -> Result<()> {
            let path = self.path_for(key)?;
            fs::create_dir_all(&self.root).with_context(|| format!("creating {:?}", self.root))?;
            fs::write(&path, blob.as_bytes()).with_context(|| format!("writing {:?}", path))?;
            tracing::debug!(path = %path.display(), bytes = blob.len(), "log written");
            Ok(())
        }
    }

    /// In-process store, insertion ordered.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        blobs: IndexMap<String, String>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn keys(&self) -> impl Iterator<Item = &str> {
            self.blobs.keys().map(String::as_str)
        }
    }

    impl DocumentStore for MemoryStore {
        fn read(&self, key: &str) -> Result<Option<String>> {
            check_key(key)?;
            Ok(self.blobs.get(key).cloned())
        }

        fn write(&mut self, key: &str, blob: &str) -> Result<()> {
            check_key(key)?;
            self.blobs.insert(key.to_string(), blob.to_string());
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::testing::sample;

        #[test]
        fn file_store_round_trips_a_log() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut store = FileStore::new(dir.path().join("logs"));
            let (empty, err) = store.load("maths").expect("load missing");
            assert!(empty.is_empty() && err.is_none());

            let doc = sample();
            store.save("maths", &doc).expect("save");
            assert!(dir.path().join("logs/maths.json").exists());
            let (loaded, err) = store.load("maths").expect("load");
            assert!(err.is_none());
            assert_eq!(loaded, doc);
        }

        #[test]
        fn corrupt_blob_loads_empty_with_reason() {
            let mut store = MemoryStore::new();
            store.write("broken", "{ nope").expect("write");
            let (doc, err) = store.load("broken").expect("load");
            assert!(doc.is_empty());
            assert!(err.is_some());
        }

        #[test]
        fn keys_cannot_escape_the_store() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut store = FileStore::new(dir.path());
            assert!(store.write("../evil", "[]").is_err());
            assert!(store.read("").is_err());
            assert!(MemoryStore::new().read(".hidden").is_err());
        }

        #[test]
        fn memory_store_keeps_insertion_order() {
            let mut store = MemoryStore::new();
            store.save("b", &sample()).expect("b");
            store.save("a", &sample()).expect("a");
            assert_eq!(store.keys().collect::<Vec<_>>(), ["b", "a"]);
        }
    }
}


pub use crate::address::{Address, ContainerAddress, NodeAddress, NodeRef, resolve, resolve_node};
pub use crate::core::{Document, EntryKind, ItemEntry, ItemType, Separator, TopLevelEntry};
pub use crate::history::History;
pub use crate::mutations::{Direction, Edit, EditError, Field, Miss};
pub use crate::projectors::flatten::{Row, RowKind, flatten, group_by_date};
pub use crate::projectors::search::filter_document;
