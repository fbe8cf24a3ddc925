use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::AppError;
use crate::repository::table_service::{count_rows_tx, FilterClause, FilterOp};
use crate::schemas::EntityDef;

/// Lowercase, ASCII-fold, collapse everything else to single hyphens.
pub fn slugify(source: &str) -> String {
    let mut slug = String::with_capacity(source.len());
    let mut last_hyphen = true;
    for character in source.chars() {
        let lowered = character.to_ascii_lowercase();
        if lowered.is_ascii_alphanumeric() {
            slug.push(lowered);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("record");
    }
    slug
}

/// Resolve a unique slug among live rows by probing `-2`, `-3`, … up to
/// `-100`, then falling back to a random suffix.
pub async fn unique_slug(
    conn: &mut PgConnection,
    entity: &EntityDef,
    slug_field: &str,
    base: &str,
    exclude_pk: Option<&Value>,
) -> Result<String, AppError> {
    let base = slugify(base);

    for attempt in 1..=100u32 {
        let candidate = if attempt == 1 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        if !slug_taken(conn, entity, slug_field, &candidate, exclude_pk).await? {
            return Ok(candidate);
        }
    }

    let suffix = Uuid::new_v4().simple().to_string();
    Ok(format!("{base}-{}", &suffix[..8]))
}

async fn slug_taken(
    conn: &mut PgConnection,
    entity: &EntityDef,
    slug_field: &str,
    candidate: &str,
    exclude_pk: Option<&Value>,
) -> Result<bool, AppError> {
    let mut filters = vec![FilterClause {
        column: slug_field.to_string(),
        op: FilterOp::Eq,
        value: json!(candidate),
    }];
    if let Some(pk_value) = exclude_pk {
        filters.push(FilterClause {
            column: entity.pk_field().to_string(),
            op: FilterOp::Neq,
            value: pk_value.clone(),
        });
    }
    let count = count_rows_tx(conn, &entity.table, &filters, entity.soft_delete).await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn slugify_normalizes() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  Multiple   Spaces  "), "multiple-spaces");
        assert_eq!(slugify("Äccénts & symbols #1"), "cc-nts-symbols-1");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
    }

    #[test]
    fn slugify_never_returns_empty() {
        assert_eq!(slugify("!!!"), "record");
        assert_eq!(slugify(""), "record");
    }
}
