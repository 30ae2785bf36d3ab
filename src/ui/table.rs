use tabled::{settings::Style, Table, Tabled};
use crate::record::ValueRecord;
use crate::structure::StructureNode;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
pub struct ValueRow {
    #[tabled(rename = "Id")]
    pub id: i64,
    #[tabled(rename = "Field")]
    pub field: String,
    #[tabled(rename = "Anchor")]
    pub anchor: String,
    #[tabled(rename = "Index")]
    pub index: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
pub struct StructureRow {
    #[tabled(rename = "Id")]
    pub id: i64,
    #[tabled(rename = "Field")]
    pub name: String,
    #[tabled(rename = "Type")]
    pub storage_type: String,
    #[tabled(rename = "Array")]
    pub is_array: bool,
    #[tabled(rename = "Store null")]
    pub store_null: bool,
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }
        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, &str)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

/// Value records of one object; `field_name` maps a structure id to a display name
pub fn value_table(records: &[ValueRecord], field_name: impl Fn(i64) -> String) -> String {
    if records.is_empty() {
        return String::new();
    }
    let rows: Vec<ValueRow> = records
        .iter()
        .map(|r| ValueRow {
            id: r.id,
            field: field_name(r.structure_id),
            anchor: r.array_parent_id.map(|a| a.to_string()).unwrap_or_default(),
            index: r.array_index.map(|i| i.to_string()).unwrap_or_default(),
            value: r.slot.describe(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Structure nodes, children indented below their parent by `depth`
pub fn structure_table(nodes: &[(usize, StructureNode)]) -> String {
    if nodes.is_empty() {
        return String::new();
    }
    let rows: Vec<StructureRow> = nodes
        .iter()
        .map(|(depth, node)| StructureRow {
            id: node.id,
            name: format!("{}{}", "  ".repeat(*depth), node.name),
            storage_type: node.storage_type.to_string(),
            is_array: node.is_array,
            store_null: node.store_null,
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Slot;
    use crate::value::StorageType;

    #[test]
    fn test_empty_tables_render_nothing() {
        assert!(TableBuilder::new().build().is_empty());
        assert!(value_table(&[], |_| String::new()).is_empty());
        assert!(structure_table(&[]).is_empty());
    }

    #[test]
    fn test_value_table_uses_field_names() {
        let records = vec![
            ValueRecord::new(10, 1, 2, None, None, Slot::Hash("abcdef0123456789".into())),
            ValueRecord::new(11, 1, 2, Some(10), Some(0), Slot::String("x".into())),
        ];
        let table = value_table(&records, |id| format!("field-{}", id));
        assert!(table.contains("field-2"));
        assert!(table.contains("\"x\""));
        assert!(table.contains("#abcdef012345"));
    }

    #[test]
    fn test_structure_table_indents_children() {
        let node = StructureNode {
            id: 4,
            scheme_id: 1,
            parent_id: Some(3),
            name: "City".into(),
            storage_type: StorageType::String,
            is_array: false,
            store_null: false,
        };
        let table = structure_table(&[(1, node)]);
        assert!(table.contains("  City"));
        assert!(table.contains("string"));
    }

    #[test]
    fn test_stats_table() {
        let table = stats_table(&[("Objects", "3")]);
        assert!(table.contains("Objects"));
        assert!(table.contains("3"));
    }
}
