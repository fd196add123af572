//! OAI-PMH `ListRecords` parsing and CERIF flattening.
//!
//! Pages are tokenized with `quick-xml` into a small element tree keyed by
//! local names (namespace prefixes dropped), then each record payload is
//! flattened into a [`Record`] according to the collection it came from.

use crate::error::{OptionExt, Result, SynthecaError};
use crate::record::{Fields, Record, Value};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Error code the feed uses for an empty selection.
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// Element with local name, attributes, concatenated text and children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| SynthecaError::Xml(e.to_string()))?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| SynthecaError::Xml(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Trimmed text content, `None` when blank.
    pub fn text(&self) -> Option<&str> {
        Some(self.text.trim()).filter(|t| !t.is_empty())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a chain of child names, taking the first match at each step.
    pub fn find(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// All nodes named by the last segment under the node reached by the
    /// preceding segments.
    pub fn find_all(&self, path: &[&str]) -> Vec<&XmlNode> {
        let Some((last, parents)) = path.split_last() else {
            return Vec::new();
        };
        self.find(parents)
            .map(|parent| parent.children.iter().filter(|c| c.name == *last).collect())
            .unwrap_or_default()
    }

    /// First descendant with the given name, depth-first.
    pub fn descendant(&self, name: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find_map(|c| if c.name == name { Some(c) } else { c.descendant(name) })
    }
}

/// Tokenize a whole document into its root element.
pub fn parse_document(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(XmlNode::from_start(&e)?),
            Ok(Event::Empty(e)) => {
                let node = XmlNode::from_start(&e)?;
                attach(&mut stack, node)?;
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().ok_or_parse("unbalanced end tag")?;
                attach(&mut stack, node)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| SynthecaError::Xml(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                let bytes = c.into_inner();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(SynthecaError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if stack.len() != 1 {
        return Err(SynthecaError::Xml("document ended inside an element".into()));
    }
    stack
        .pop()
        .and_then(|doc| doc.children.into_iter().next())
        .ok_or_else(|| SynthecaError::Xml("empty document".into()))
}

fn attach(stack: &mut [XmlNode], node: XmlNode) -> Result<()> {
    let parent = stack
        .last_mut()
        .ok_or_else(|| SynthecaError::Xml("element outside document".into()))?;
    parent.children.push(node);
    Ok(())
}

/// One live record of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct OaiRecord {
    pub header_identifier: Option<String>,
    pub datestamp: Option<String>,
    /// Entity element inside `<metadata>`, wrapper elements removed
    pub payload: XmlNode,
}

/// Parsed `ListRecords` page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OaiPage {
    pub records: Vec<OaiRecord>,
    pub resumption_token: Option<String>,
    pub complete_list_size: Option<u64>,
    /// Records flagged `status="deleted"` in their header
    pub deleted: usize,
    /// Records without a metadata payload
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListRecordsResponse {
    Page(OaiPage),
    /// The feed reported `noRecordsMatch`: a complete, empty result
    NoRecordsMatch,
}

/// Parse one `ListRecords` response body.
///
/// OAI error elements other than `noRecordsMatch` become
/// [`SynthecaError::Oai`]; bodies that are not OAI-PMH at all become
/// `Parse` or `Xml` errors.
pub fn parse_list_records(body: &str) -> Result<ListRecordsResponse> {
    let root = parse_document(body)?;
    if root.name != "OAI-PMH" {
        return Err(SynthecaError::Parse(format!(
            "expected OAI-PMH root element, found <{}>",
            root.name
        )));
    }

    if let Some(error) = root.child("error") {
        let code = error.attr("code").unwrap_or_default();
        if code == NO_RECORDS_MATCH {
            return Ok(ListRecordsResponse::NoRecordsMatch);
        }
        return Err(SynthecaError::Oai {
            code: code.to_string(),
            message: error.text().unwrap_or_default().to_string(),
        });
    }

    let list = root
        .children
        .into_iter()
        .find(|c| c.name == "ListRecords")
        .ok_or_parse("response has neither ListRecords nor error")?;

    let mut page = OaiPage::default();

    for child in list.children {
        match child.name.as_str() {
            "record" => {
                let header = child.child("header");
                if header.and_then(|h| h.attr("status")) == Some("deleted") {
                    page.deleted += 1;
                    continue;
                }
                let header_identifier = header
                    .and_then(|h| h.child("identifier"))
                    .and_then(XmlNode::text)
                    .map(str::to_string);
                let datestamp = header
                    .and_then(|h| h.child("datestamp"))
                    .and_then(XmlNode::text)
                    .map(str::to_string);

                let payload = child
                    .children
                    .into_iter()
                    .find(|c| c.name == "metadata")
                    .and_then(|m| m.children.into_iter().next());

                match payload {
                    Some(payload) => page.records.push(OaiRecord {
                        header_identifier,
                        datestamp,
                        payload: unwrap_payload(payload),
                    }),
                    None => page.skipped += 1,
                }
            }
            "resumptionToken" => {
                page.complete_list_size = child
                    .attr("completeListSize")
                    .and_then(|s| s.parse().ok());
                page.resumption_token = child.text().map(str::to_string);
            }
            _ => {}
        }
    }

    Ok(ListRecordsResponse::Page(page))
}

/// `openaire_cris:publication` style wrappers hold the `cerif:Publication`
/// element of the same name.
fn unwrap_payload(node: XmlNode) -> XmlNode {
    let inner = node
        .children
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(&node.name) && c.name != node.name);
    match inner {
        Some(idx) => node.children.into_iter().nth(idx).unwrap_or_default(),
        None => node,
    }
}

/// Which flattener applies to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Publication,
    Person,
    OrgUnit,
}

impl RecordKind {
    pub fn from_collection(collection: &str) -> Self {
        let lower = collection.to_lowercase();
        if lower.contains("person") {
            RecordKind::Person
        } else if lower.contains("orgunit") || lower.contains("orgs") {
            RecordKind::OrgUnit
        } else {
            RecordKind::Publication
        }
    }
}

/// Flatten a record payload. `fallback_id` is used when neither the entity
/// nor the header carries an identifier.
pub fn flatten_record(kind: RecordKind, collection: &str, record: &OaiRecord, fallback_id: String) -> Record {
    let node = &record.payload;
    let identifier = node
        .attr("id")
        .map(str::to_string)
        .or_else(|| record.header_identifier.clone())
        .unwrap_or(fallback_id);

    let mut out = Record::new(collection, identifier.clone());
    out.fields = match kind {
        RecordKind::Publication => flatten_publication(node),
        RecordKind::Person => flatten_person(node),
        RecordKind::OrgUnit => flatten_orgunit(node),
    };
    out.insert("pure_id", identifier);
    if let Some(stamp) = &record.datestamp {
        out.insert("datestamp", stamp.as_str());
    }
    out
}

fn text_at(node: &XmlNode, path: &[&str]) -> Value {
    node.find(path).and_then(XmlNode::text).into()
}

fn id_at(node: &XmlNode, path: &[&str]) -> Value {
    node.find(path).and_then(|n| n.attr("id")).into()
}

fn enum_at(node: &XmlNode, path: &[&str]) -> Value {
    node.find(path).and_then(XmlNode::text).map(parse_enum).into()
}

fn texts_of(node: &XmlNode, name: &str) -> Value {
    Value::List(
        node.children_named(name)
            .filter_map(XmlNode::text)
            .map(Value::from)
            .collect(),
    )
}

/// Controlled-vocabulary URIs reduce to their trailing segment.
pub fn parse_enum(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('/') || raw.contains('#') {
        let tail = raw.rsplit('/').next().unwrap_or(raw);
        tail.rsplit('#').next().unwrap_or(tail).to_string()
    } else {
        raw.to_string()
    }
}

fn flatten_publication(p: &XmlNode) -> Fields {
    let mut f = Fields::new();
    f.insert("type".into(), enum_at(p, &["Type"]));
    f.insert("language".into(), text_at(p, &["Language"]));
    f.insert("title".into(), text_at(p, &["Title"]));
    f.insert("subtitle".into(), text_at(p, &["Subtitle"]));
    f.insert("publication_date".into(), text_at(p, &["PublicationDate"]));
    f.insert("doi".into(), text_at(p, &["DOI"]));
    f.insert("url".into(), text_at(p, &["URL"]));
    f.insert("abstract".into(), text_at(p, &["Abstract"]));
    f.insert("volume".into(), text_at(p, &["Volume"]));
    f.insert("issue".into(), text_at(p, &["Issue"]));
    f.insert("start_page".into(), text_at(p, &["StartPage"]));
    f.insert("end_page".into(), text_at(p, &["EndPage"]));
    f.insert("status".into(), enum_at(p, &["Status"]));
    f.insert("access_right".into(), enum_at(p, &["Access"]));
    f.insert("license".into(), enum_at(p, &["License"]));
    f.insert("authors".into(), contributors(p.find_all(&["Authors", "Author"])));
    f.insert("editors".into(), contributors(p.find_all(&["Editors", "Editor"])));
    f.insert("keywords".into(), texts_of(p, "Keyword"));
    f.insert("isbn".into(), texts_of(p, "ISBN"));
    f.insert("issn".into(), texts_of(p, "ISSN"));
    f.insert(
        "publisher_name".into(),
        text_at(p, &["Publishers", "Publisher", "OrgUnit", "Name"]),
    );
    f.insert("published_in_id".into(), id_at(p, &["PublishedIn", "Publication"]));
    f.insert(
        "published_in_title".into(),
        text_at(p, &["PublishedIn", "Publication", "Title"]),
    );
    f.insert("part_of_id".into(), id_at(p, &["PartOf", "Publication"]));
    f.insert("part_of_title".into(), text_at(p, &["PartOf", "Publication", "Title"]));
    f.insert("event_name".into(), text_at(p, &["PresentedAt", "Event", "Name"]));
    f.insert("event_acronym".into(), text_at(p, &["PresentedAt", "Event", "Acronym"]));
    f.insert("file_locations".into(), file_locations(p));
    f.insert("references".into(), references(p));
    f
}

fn contributors(nodes: Vec<&XmlNode>) -> Value {
    let mut out = Vec::new();
    for item in nodes {
        let Some(person) = item.child("Person") else {
            continue;
        };
        let affiliation = item.find(&["Affiliation", "OrgUnit"]);
        let mut c = Fields::new();
        c.insert("person_id".into(), person.attr("id").into());
        c.insert("family_names".into(), text_at(person, &["PersonName", "FamilyNames"]));
        c.insert("first_names".into(), text_at(person, &["PersonName", "FirstNames"]));
        c.insert(
            "affiliation_id".into(),
            affiliation.and_then(|a| a.attr("id")).into(),
        );
        c.insert(
            "affiliation_name".into(),
            affiliation
                .and_then(|a| a.child("Name"))
                .and_then(XmlNode::text)
                .into(),
        );
        out.push(Value::Record(c));
    }
    Value::List(out)
}

fn file_locations(p: &XmlNode) -> Value {
    let media = p
        .find_all(&["FileLocations", "Medium"])
        .into_iter()
        .map(|m| {
            let mut f = Fields::new();
            f.insert("type".into(), enum_at(m, &["Type"]));
            f.insert("title".into(), text_at(m, &["Title"]));
            f.insert("uri".into(), text_at(m, &["URI"]));
            f.insert("mime_type".into(), text_at(m, &["MimeType"]));
            f.insert("size".into(), text_at(m, &["Size"]));
            f.insert("access".into(), enum_at(m, &["Access"]));
            Value::Record(f)
        })
        .collect();
    Value::List(media)
}

fn references(p: &XmlNode) -> Value {
    let refs = p
        .find_all(&["References", "Publication"])
        .into_iter()
        .map(|r| {
            let mut f = Fields::new();
            f.insert("id".into(), r.attr("id").into());
            f.insert("type".into(), enum_at(r, &["Type"]));
            f.insert("title".into(), text_at(r, &["Title"]));
            Value::Record(f)
        })
        .collect();
    Value::List(refs)
}

fn flatten_person(p: &XmlNode) -> Fields {
    let mut f = Fields::new();
    f.insert("family_names".into(), text_at(p, &["PersonName", "FamilyNames"]));
    f.insert("first_names".into(), text_at(p, &["PersonName", "FirstNames"]));
    f.insert("orcid".into(), text_at(p, &["ORCID"]));
    f.insert(
        "affiliation_ids".into(),
        Value::List(
            p.children_named("Affiliation")
                .filter_map(|a| a.child("OrgUnit"))
                .filter_map(|o| o.attr("id"))
                .map(Value::from)
                .collect(),
        ),
    );
    f
}

fn flatten_orgunit(o: &XmlNode) -> Fields {
    let mut f = Fields::new();
    f.insert("name".into(), text_at(o, &["Name"]));
    f.insert("acronym".into(), text_at(o, &["Acronym"]));
    f.insert("type".into(), enum_at(o, &["Type"]));
    f.insert("parent_org".into(), id_at(o, &["PartOf", "OrgUnit"]));
    f
}
