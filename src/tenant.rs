//! 租户注册表：租户 ID 到大小、类型、存储目录与认证策略的只读映射。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::normalize_relative;

const MIB: u64 = 1024 * 1024;

/// 单个租户的策略，进程启动后不可变。
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPolicy {
    pub max_file_size: u64,
    pub allowed_types: Vec<String>,
    /// 相对上传根目录的存储路径。
    pub storage_root: PathBuf,
    #[serde(default)]
    pub requires_auth: bool,
    /// 仅作展示，不影响传输。
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default)]
    pub description: String,
}

/// 已解析的租户：策略与绝对存储目录。
#[derive(Clone, Debug)]
pub struct Tenant {
    pub id: String,
    pub policy: Arc<TenantPolicy>,
    pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant {0} has an invalid storage root")]
    InvalidStorageRoot(String),
    #[error("tenant id must not be empty")]
    EmptyId,
    #[error("failed to read tenants file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse tenants file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct TenantRegistry {
    tenants: HashMap<String, Tenant>,
}

impl TenantRegistry {
    /// 以上传根目录为基准构建注册表，并校验每个存储路径不会越出根目录。
    pub fn new(
        base_dir: &Path,
        policies: HashMap<String, TenantPolicy>,
    ) -> Result<Self, TenantError> {
        let mut tenants = HashMap::with_capacity(policies.len());
        for (id, policy) in policies {
            if id.trim().is_empty() {
                return Err(TenantError::EmptyId);
            }
            let relative = normalize_relative(&policy.storage_root.to_string_lossy())
                .map_err(|_| TenantError::InvalidStorageRoot(id.clone()))?;
            if relative.as_os_str().is_empty() {
                return Err(TenantError::InvalidStorageRoot(id));
            }
            let tenant = Tenant {
                id: id.clone(),
                root: base_dir.join(relative),
                policy: Arc::new(policy),
            };
            tenants.insert(id, tenant);
        }
        Ok(Self { tenants })
    }

    /// 从 JSON 文件（租户 ID -> 策略）加载，替换内置表。
    pub fn from_json_file(base_dir: &Path, path: &Path) -> Result<Self, TenantError> {
        let content = std::fs::read(path)?;
        let policies: HashMap<String, TenantPolicy> = serde_json::from_slice(&content)?;
        Self::new(base_dir, policies)
    }

    pub fn lookup(&self, tenant_id: &str) -> Option<&Tenant> {
        self.tenants.get(tenant_id)
    }

    pub fn exists(&self, tenant_id: &str) -> bool {
        self.tenants.contains_key(tenant_id)
    }

    pub fn list_all(&self) -> BTreeSet<String> {
        self.tenants.keys().cloned().collect()
    }
}

/// 内置租户表。
pub fn builtin_policies() -> HashMap<String, TenantPolicy> {
    let documents = || {
        vec![
            "image/*".to_string(),
            "application/pdf".to_string(),
            "text/*".to_string(),
        ]
    };
    let unrestricted = || vec!["*/*".to_string()];

    HashMap::from([
        (
            "acricolor".to_string(),
            TenantPolicy {
                max_file_size: 50 * MIB,
                allowed_types: documents(),
                storage_root: PathBuf::from("acricolor"),
                requires_auth: true,
                compression_enabled: true,
                description: "Acricolor catalogues and documents".to_string(),
            },
        ),
        (
            "lobeck".to_string(),
            TenantPolicy {
                max_file_size: 100 * MIB,
                allowed_types: unrestricted(),
                storage_root: PathBuf::from("lobeck"),
                requires_auth: true,
                compression_enabled: true,
                description: "Lobeck technical documents and manuals".to_string(),
            },
        ),
        (
            "gaesa".to_string(),
            TenantPolicy {
                max_file_size: 200 * MIB,
                allowed_types: unrestricted(),
                storage_root: PathBuf::from("gaesa"),
                requires_auth: true,
                compression_enabled: true,
                description: "Gaesa engineering and project files".to_string(),
            },
        ),
        (
            "shared".to_string(),
            TenantPolicy {
                max_file_size: 10 * MIB,
                allowed_types: documents(),
                storage_root: PathBuf::from("shared"),
                requires_auth: false,
                compression_enabled: false,
                description: "Shared files, no authentication required".to_string(),
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_registry_resolves_roots_under_base() {
        let registry =
            TenantRegistry::new(Path::new("/srv/uploads"), builtin_policies()).expect("registry");
        let shared = registry.lookup("shared").expect("shared tenant");
        assert_eq!(shared.root, PathBuf::from("/srv/uploads/shared"));
        assert!(!shared.policy.requires_auth);
        assert!(registry.exists("gaesa"));
        assert!(!registry.exists("acme"));
        assert_eq!(
            registry.list_all().into_iter().collect::<Vec<_>>(),
            vec!["acricolor", "gaesa", "lobeck", "shared"]
        );
    }

    #[test]
    fn storage_root_may_not_escape_base() {
        for root in ["../outside", "/etc", "", "."] {
            let mut policies = builtin_policies();
            if let Some(policy) = policies.get_mut("shared") {
                policy.storage_root = PathBuf::from(root);
            }
            let result = TenantRegistry::new(Path::new("/srv/uploads"), policies);
            assert!(
                matches!(result, Err(TenantError::InvalidStorageRoot(_))),
                "root {root:?} should be rejected"
            );
        }
    }

    #[test]
    fn tenants_file_replaces_builtin_table() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("tenants.json");
        std::fs::write(
            &file,
            r#"{"acme": {"maxFileSize": 1024, "allowedTypes": [".csv"], "storageRoot": "acme/files"}}"#,
        )
        .expect("write tenants file");

        let registry = TenantRegistry::from_json_file(temp.path(), &file).expect("registry");
        let acme = registry.lookup("acme").expect("acme tenant");
        assert_eq!(acme.policy.max_file_size, 1024);
        assert!(!acme.policy.requires_auth);
        assert_eq!(acme.root, temp.path().join("acme/files"));
        assert!(!registry.exists("shared"));
    }
}
