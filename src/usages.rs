//! Symbol-usage index: which methods statically reference a given member.

use std::any::Any;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feature::{ClassChanges, Feature, FeatureRow, FeatureSink};
use crate::model::{MemberRef, member_key};
use crate::snapshot::ClasspathSnapshot;

pub const USAGES_FEATURE: &str = "usages";

/// One referencing site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Usage {
    pub class: String,
    pub method: String,
    pub descriptor: String,
}

/// Indexes `referenced member → (referencing class, referencing method)`.
/// Matching is exact on the statically referenced owner, name and descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct Usages;

impl Usages {
    pub fn new() -> Self {
        Self
    }

    /// Usages of `owner.name` (any declared descriptor when `descriptor` is
    /// `None`). An owner absent from the snapshot yields no usages.
    pub fn find_usages(
        snapshot: &ClasspathSnapshot,
        owner: &str,
        name: &str,
        descriptor: Option<&str>,
    ) -> Result<Vec<Usage>> {
        let Some(owner_class) = snapshot.find_class_or_null(owner)? else {
            return Ok(Vec::new());
        };

        let descriptors: BTreeSet<String> = match descriptor {
            Some(d) => BTreeSet::from([d.to_string()]),
            None => owner_class
                .methods()
                .iter()
                .filter(|m| m.name == name)
                .map(|m| m.descriptor.clone())
                .chain(
                    owner_class
                        .fields()
                        .iter()
                        .filter(|f| f.name == name)
                        .map(|f| f.descriptor.clone()),
                )
                .collect(),
        };

        let mut usages = BTreeSet::new();
        for descriptor in &descriptors {
            let key = member_key(owner, name, descriptor);
            for row in snapshot.feature_rows(USAGES_FEATURE, &key)? {
                match serde_json::from_str::<Usage>(&row.payload) {
                    Ok(usage) => {
                        usages.insert(usage);
                    }
                    Err(err) => {
                        tracing::warn!(key = %row.key, %err, "skipping undecodable usage row");
                    }
                }
            }
        }
        Ok(usages.into_iter().collect())
    }

    /// Raw rows for `member`, without resolving its owner first.
    pub fn find_references(
        snapshot: &ClasspathSnapshot,
        member: &MemberRef,
    ) -> Result<Vec<FeatureRow>> {
        snapshot.feature_rows(USAGES_FEATURE, &member.key())
    }
}

impl Feature for Usages {
    fn name(&self) -> &str {
        USAGES_FEATURE
    }

    fn on_classes_changed(&self, changes: &ClassChanges<'_>, sink: &mut FeatureSink) {
        for class in changes.current() {
            for method in class.methods() {
                for reference in &method.references {
                    let usage = Usage {
                        class: class.name().to_string(),
                        method: method.name.clone(),
                        descriptor: method.descriptor.clone(),
                    };
                    match serde_json::to_string(&usage) {
                        Ok(payload) => sink.emit(class, reference.key(), payload),
                        Err(err) => {
                            tracing::warn!(class = class.name(), %err, "failed to encode usage");
                        }
                    }
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureRegistry;
    use crate::model::{
        AccessFlags, DecodedClass, Fingerprint, LibraryLocation, MemberKind, MethodRecord,
        ParsedClass,
    };
    use crate::store::SymbolStore;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn caller() -> DecodedClass {
        DecodedClass {
            entry: "a/A.class".into(),
            content_hash: "h".into(),
            class: ParsedClass {
                name: "a.A".into(),
                super_class: Some("java.lang.Object".into()),
                interfaces: Vec::new(),
                access: AccessFlags::default(),
                fields: Vec::new(),
                methods: vec![MethodRecord {
                    name: "m".into(),
                    descriptor: "()V".into(),
                    access: AccessFlags::default(),
                    references: vec![
                        MemberRef::new("b.B", "n", "()V", MemberKind::Method),
                        MemberRef::new("b.B", "f", "I", MemberKind::Field),
                    ],
                }],
                annotations: Vec::new(),
            },
        }
    }

    #[test]
    fn indexes_each_referenced_member() {
        let store = SymbolStore::new();
        let features = FeatureRegistry::new();
        features.install(Arc::new(Usages::new())).unwrap();
        let location = LibraryLocation::from_canonical(PathBuf::from("/libs/a.jar"));

        let generation = store.prepare(&location, Fingerprint("fp".into()), vec![caller()], Vec::new());
        store
            .publish(&location, Some(Arc::clone(&generation)), |ctx| {
                features.apply_publish(features.plan_publish(ctx));
                Ok(())
            })
            .unwrap();
        for batch in features.pending_batches(&generation) {
            let derived = batch.derive();
            store.while_current(&generation, || features.apply_sync(derived));
        }

        let scope = [generation.id()];
        let rows = features.rows(USAGES_FEATURE, "b.B#n()V", &scope).unwrap();
        assert_eq!(rows.len(), 1);
        let usage: Usage = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(
            usage,
            Usage {
                class: "a.A".into(),
                method: "m".into(),
                descriptor: "()V".into(),
            }
        );
        assert_eq!(features.rows(USAGES_FEATURE, "b.B#fI", &scope).unwrap().len(), 1);
        assert!(features.rows(USAGES_FEATURE, "b.B#n(I)V", &scope).unwrap().is_empty());
    }
}
