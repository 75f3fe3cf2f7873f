//! Master-detail relationship graph
//!
//! The coordinator knows which block constrains which, through which column
//! correspondence, and whether a detail may be queried without a master
//! row. It owns no block state; cascades are driven by the form, which asks
//! the coordinator for graph walks and join filters.

use ff_core::{DataError, Filter, Record};
use parking_lot::RwLock;

/// One master-detail edge.
#[derive(Debug, Clone)]
pub struct Link {
    pub master: String,
    pub detail: String,
    pub master_columns: Vec<String>,
    pub detail_columns: Vec<String>,
    /// Whether the detail may be queried when the master has no current
    /// row. When false, the detail is excluded from the cascade instead.
    pub allow_master_less: bool,
}

impl Link {
    pub fn new(
        master: &str,
        detail: &str,
        master_columns: &[&str],
        detail_columns: &[&str],
        allow_master_less: bool,
    ) -> Self {
        Self {
            master: master.to_string(),
            detail: detail.to_string(),
            master_columns: master_columns.iter().map(|c| c.to_lowercase()).collect(),
            detail_columns: detail_columns.iter().map(|c| c.to_lowercase()).collect(),
            allow_master_less,
        }
    }
}

/// Acyclic link graph over a form's blocks.
pub struct BlockCoordinator {
    links: RwLock<Vec<Link>>,
}

impl BlockCoordinator {
    pub fn new() -> Self {
        Self {
            links: RwLock::new(Vec::new()),
        }
    }

    /// Add an edge. Rejects mismatched column lists and edges that would
    /// make the master->detail graph cyclic.
    pub fn link(&self, link: Link) -> anyhow::Result<()> {
        if link.master_columns.len() != link.detail_columns.len() {
            return Err(DataError::Other(format!(
                "link {} -> {} maps {} master columns onto {} detail columns",
                link.master,
                link.detail,
                link.master_columns.len(),
                link.detail_columns.len()
            ))
            .into());
        }

        if link.master == link.detail
            || self
                .get_detail_blocks(&link.detail, true)
                .contains(&link.master)
        {
            return Err(DataError::Other(format!(
                "link {} -> {} would create a cycle",
                link.master, link.detail
            ))
            .into());
        }

        self.links.write().push(link);
        Ok(())
    }

    /// Direct or transitive details of a block, depth-first, de-duplicated.
    pub fn get_detail_blocks(&self, block: &str, recursive: bool) -> Vec<String> {
        let links = self.links.read();
        let mut details: Vec<String> = Vec::new();

        let mut stack = vec![block.to_string()];
        while let Some(master) = stack.pop() {
            for link in links.iter().filter(|l| l.master == master) {
                if details.iter().any(|d| d == &link.detail) {
                    continue;
                }
                details.push(link.detail.clone());
                if recursive {
                    stack.push(link.detail.clone());
                }
            }
        }

        details
    }

    /// Links in which `detail` is the detail side.
    pub fn get_master_links(&self, detail: &str) -> Vec<Link> {
        self.links
            .read()
            .iter()
            .filter(|l| l.detail == detail)
            .cloned()
            .collect()
    }

    /// Direct masters of a block.
    pub fn get_master_blocks(&self, detail: &str) -> Vec<String> {
        self.get_master_links(detail)
            .into_iter()
            .map(|l| l.master)
            .collect()
    }

    /// Walk master edges upward to the root the query cascade starts from.
    /// Terminates on the first block without a master; a visited set guards
    /// against malformed graphs.
    pub fn get_query_master(&self, block: &str) -> String {
        let mut current = block.to_string();
        let mut visited = vec![current.clone()];

        loop {
            let masters = self.get_master_blocks(&current);
            match masters.into_iter().find(|m| !visited.contains(m)) {
                Some(master) => {
                    visited.push(master.clone());
                    current = master;
                }
                None => return current,
            }
        }
    }

    /// Whether a detail may be queried without a master row.
    pub fn allow_master_less(&self, master: &str, detail: &str) -> bool {
        self.links
            .read()
            .iter()
            .find(|l| l.master == master && l.detail == detail)
            .map(|l| l.allow_master_less)
            .unwrap_or(false)
    }

    /// Query-by-example mode is permitted unless the block is strictly
    /// bound to a master (a link that forbids master-less queries).
    pub fn allow_query_mode(&self, block: &str) -> bool {
        self.get_master_links(block)
            .iter()
            .all(|l| l.allow_master_less)
    }

    /// Details whose link involves the given master column. Used when a
    /// single field change should requery only the dependents joined on it.
    pub fn get_detail_blocks_for_field(&self, block: &str, field: &str) -> Vec<String> {
        let field = field.to_lowercase();
        let mut details: Vec<String> = Vec::new();

        for link in self.links.read().iter() {
            if link.master == block
                && link.master_columns.contains(&field)
                && !details.contains(&link.detail)
            {
                details.push(link.detail.clone());
            }
        }

        details
    }

    /// Join filter constraining a detail to the master's current row,
    /// mapped through the link's column correspondence.
    pub fn join_filter(link: &Link, master_row: &Record) -> Filter {
        if link.detail_columns.len() == 1 {
            Filter::Equals {
                column: link.detail_columns[0].clone(),
                value: master_row.value(&link.master_columns[0]),
            }
        } else {
            let tuple = link
                .master_columns
                .iter()
                .map(|c| master_row.value(c))
                .collect();

            Filter::SubQuery {
                columns: link.detail_columns.clone(),
                rows: Some(vec![tuple]),
            }
        }
    }
}

impl Default for BlockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::Value;

    fn graph() -> BlockCoordinator {
        let cord = BlockCoordinator::new();
        cord.link(Link::new("customers", "orders", &["custid"], &["custid"], false))
            .unwrap();
        cord.link(Link::new("orders", "lines", &["orderid"], &["orderid"], false))
            .unwrap();
        cord.link(Link::new("customers", "notes", &["custid"], &["custid"], true))
            .unwrap();
        cord
    }

    #[test]
    fn detail_walks_direct_and_transitive() {
        let cord = graph();

        let direct = cord.get_detail_blocks("customers", false);
        assert_eq!(direct, vec!["orders".to_string(), "notes".to_string()]);

        let all = cord.get_detail_blocks("customers", true);
        assert!(all.contains(&"lines".to_string()));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn query_master_walks_to_root() {
        let cord = graph();

        assert_eq!(cord.get_query_master("lines"), "customers");
        assert_eq!(cord.get_query_master("orders"), "customers");
        assert_eq!(cord.get_query_master("customers"), "customers");
    }

    #[test]
    fn cycles_are_rejected() {
        let cord = graph();

        assert!(cord
            .link(Link::new("lines", "customers", &["a"], &["a"], true))
            .is_err());
        assert!(cord
            .link(Link::new("orders", "orders", &["a"], &["a"], true))
            .is_err());
    }

    #[test]
    fn query_mode_follows_master_less_rule() {
        let cord = graph();

        assert!(cord.allow_query_mode("customers"));
        assert!(cord.allow_query_mode("notes"));
        assert!(!cord.allow_query_mode("orders"));
    }

    #[test]
    fn join_filter_maps_column_correspondence() {
        let link = Link::new("customers", "orders", &["custid"], &["cust"], false);

        let mut row = Record::new();
        row.set_value("custid", 7);

        match BlockCoordinator::join_filter(&link, &row) {
            Filter::Equals { column, value } => {
                assert_eq!(column, "cust");
                assert_eq!(value, Value::Int(7));
            }
            other => panic!("expected equals filter, got {:?}", other),
        }
    }

    #[test]
    fn multi_column_links_join_on_tuples() {
        let link = Link::new(
            "orders",
            "lines",
            &["orderid", "site"],
            &["orderid", "site"],
            false,
        );

        let mut row = Record::new();
        row.set_value("orderid", 1);
        row.set_value("site", "main");

        match BlockCoordinator::join_filter(&link, &row) {
            Filter::SubQuery { columns, rows } => {
                assert_eq!(columns, vec!["orderid".to_string(), "site".to_string()]);
                assert_eq!(rows.unwrap()[0], vec![Value::Int(1), Value::Text("main".into())]);
            }
            other => panic!("expected subquery filter, got {:?}", other),
        }
    }
}
