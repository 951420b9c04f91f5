use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// Maps location codes (e.g. `SJC`) to a human readable description.
#[derive(Debug, Clone, Default)]
pub struct LocationTable {
    entries: HashMap<String, String>,
}

impl LocationTable {
    /// 每行格式: `地区/城市,名称(代码)`
    ///
    /// The code is taken from inside the last pair of parentheses, or the
    /// whole second field when there are none. The description is the line.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((_, name)) = line.split_once(',') else {
                continue;
            };
            let code = match (name.rfind('('), name.rfind(')')) {
                (Some(open), Some(close)) if open < close => &name[open + 1..close],
                _ => name,
            };
            let code = code.trim();
            // "NA-SJC" style codes carry a region prefix
            let code = code.rsplit('-').next().unwrap_or(code).trim();
            if !code.is_empty() {
                entries.insert(code.to_ascii_uppercase(), line.to_string());
            }
        }
        Self { entries }
    }

    /// A missing or unreadable table only costs us pretty names.
    pub async fn load_or_empty(path: &Path) -> Self {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let table = Self::parse(&content);
                tracing::info!(count = table.len(), ?path, "Loaded location names");
                table
            }
            Err(e) => {
                tracing::warn!(?path, error = %e, "Location table unavailable, using raw codes");
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Description for `code`, falling back to the raw code.
    pub fn describe(&self, code: &str) -> String {
        self.entries
            .get(&code.to_ascii_uppercase())
            .cloned()
            .unwrap_or_else(|| code.to_string())
    }

    /// Codes in sorted order, for listing the available filters.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}
