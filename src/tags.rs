//! Template tag catalog.
//!
//! Tags are the mutable half of template addressing: `(template_id, tag) ->
//! build_id`, looked up before every sandbox create or resume. `latest` is
//! reserved -- every successful build claims it implicitly, and it can
//! never be deleted here. Built on `store.rs`'s `assign_tags`/`delete_tags`
//! atomic composite operations; this module is the validation and
//! cache-invalidation layer in front of them.

use uuid::Uuid;

use crate::cache::TemplateCache;
use crate::context::{assert_owns_team, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::model::{Tag, Team, DEFAULT_TAG};
use crate::store::Store;

/// A parsed `"<alias-or-id>[:<tag>]"` target. Tag defaults to `latest` when
/// omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct TagTarget {
    pub identifier: String,
    pub tag: String,
}

/// One requested `(target, build)` pair for `assign_tags`.
#[derive(Debug, Clone)]
pub struct TagAssignment {
    pub target: String,
    pub build_id: Uuid,
}

pub fn parse_target(raw: &str) -> ApiResult<TagTarget> {
    if raw.is_empty() {
        return Err(ApiError::invalid_input("tag target must not be empty"));
    }
    match raw.rsplit_once(':') {
        Some((identifier, tag)) if !identifier.is_empty() => {
            validate_tag_name(tag)?;
            Ok(TagTarget {
                identifier: identifier.to_string(),
                tag: tag.to_string(),
            })
        }
        _ => Ok(TagTarget {
            identifier: raw.to_string(),
            tag: DEFAULT_TAG.to_string(),
        }),
    }
}

/// Tags are filesystem- and URL-safe by construction: ASCII alphanumerics,
/// `.`, `_`, `-` only, and never empty. No `/` -- that would collide with
/// the `team-slug/template` alias namespace.
fn validate_tag_name(tag: &str) -> ApiResult<()> {
    if tag.is_empty() {
        return Err(ApiError::invalid_input("tag name must not be empty"));
    }
    let valid = tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(ApiError::invalid_input(format!(
            "tag '{tag}' contains characters outside [a-zA-Z0-9._-]"
        )));
    }
    Ok(())
}

async fn resolve_template_id(store: &dyn Store, team: &Team, identifier: &str) -> ApiResult<String> {
    if let Some(alias) = store.resolve_alias(identifier, Some(&team.slug)).await? {
        return Ok(alias.template_id);
    }
    if let Some(template) = store.get_template(identifier).await? {
        if template.team_id == team.id {
            return Ok(template.id);
        }
        return Err(ApiError::forbidden(format!("'{identifier}' belongs to a different team")));
    }
    Err(ApiError::not_found(format!("no template matches '{identifier}'")))
}

/// `AssignTags(ctx, team, targets)`. Every assignment is validated and
/// resolved to a concrete `(template_id, tag, build_id)` triple before any
/// store write happens, so a bad target in a batch fails the whole batch
/// rather than partially applying.
pub async fn assign_tags(
    store: &dyn Store,
    cache: &TemplateCache,
    ctx: &RequestContext,
    team: &Team,
    assignments: &[TagAssignment],
) -> ApiResult<Vec<Tag>> {
    if assignments.is_empty() {
        return Err(ApiError::invalid_input("no tag assignments given"));
    }

    let mut resolved = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let target = parse_target(&assignment.target)?;
        let template_id = resolve_template_id(store, team, &target.identifier).await?;
        assert_owns_team(store, ctx, team.id).await?;

        let build = store
            .get_build(assignment.build_id)
            .await?
            .ok_or_else(|| ApiError::not_found("build not found"))?;
        if build.template_id != template_id {
            return Err(ApiError::invalid_input("build does not belong to the target template"));
        }

        resolved.push((template_id, target.tag, assignment.build_id));
    }

    // Group by template_id so each template's tags commit in a single
    // atomic store call.
    let mut by_template: std::collections::HashMap<String, Vec<(String, Uuid)>> = std::collections::HashMap::new();
    for (template_id, tag, build_id) in &resolved {
        by_template.entry(template_id.clone()).or_default().push((tag.clone(), *build_id));
    }
    for (template_id, tags) in &by_template {
        store.assign_tags(template_id, tags).await?;
        for (tag, _) in tags {
            cache.invalidate(template_id, tag);
        }
    }

    let mut out = Vec::with_capacity(resolved.len());
    for (template_id, tag, build_id) in resolved {
        out.push(Tag { template_id, tag, build_id });
    }
    Ok(out)
}

/// `DeleteTags(ctx, team, templateIdentifier, tags)`. Rejects the whole
/// batch if `latest` is among the requested tags -- it is the only tag a
/// template can never be left without.
pub async fn delete_tags(
    store: &dyn Store,
    cache: &TemplateCache,
    ctx: &RequestContext,
    team: &Team,
    template_identifier: &str,
    tags: &[String],
) -> ApiResult<()> {
    if tags.is_empty() {
        return Err(ApiError::invalid_input("no tags given to delete"));
    }
    if tags.iter().any(|t| t == DEFAULT_TAG) {
        return Err(ApiError::invalid_input("the 'latest' tag is reserved and cannot be deleted"));
    }
    for tag in tags {
        validate_tag_name(tag)?;
    }

    let template_id = resolve_template_id(store, team, template_identifier).await?;
    assert_owns_team(store, ctx, team.id).await?;

    store.delete_tags(&template_id, tags).await?;
    for tag in tags {
        cache.invalidate(&template_id, tag);
    }
    Ok(())
}

/// Loader for the bare-template-id cache shape (`GetByID`), used by callers
/// whose identity spans multiple teams and therefore can't resolve aliases.
pub(crate) async fn load_template_info(store: &dyn Store, template_id: &str, tag: &str) -> ApiResult<crate::cache::AliasInfo> {
    let template = store
        .get_template(template_id)
        .await?
        .ok_or_else(|| ApiError::not_found("template not found"))?;
    let tag_row = store
        .get_tag(&template.id, tag)
        .await?
        .ok_or_else(|| ApiError::not_found("tag not found"))?;
    let build = store
        .get_build(tag_row.build_id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;
    Ok(crate::cache::AliasInfo {
        template_id: template.id,
        team_id: template.team_id,
        public: template.public,
        aliases: Vec::new(),
        build,
    })
}

pub(crate) async fn load_alias_info(
    store: &dyn Store,
    team_slug: &str,
    identifier: &str,
    tag: &str,
) -> ApiResult<crate::cache::AliasInfo> {
    let alias = store
        .resolve_alias(identifier, Some(team_slug))
        .await?
        .ok_or_else(|| ApiError::not_found("alias not found"))?;
    let tag_row = store
        .get_tag(&alias.template_id, tag)
        .await?
        .ok_or_else(|| ApiError::not_found("tag not found"))?;
    let build = store
        .get_build(tag_row.build_id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;
    Ok(crate::cache::AliasInfo {
        template_id: alias.template_id,
        team_id: alias.team_id,
        public: alias.public,
        aliases: vec![alias.identifier],
        build,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildStatus, EnvBuild, Template};
    use crate::store::InMemoryStore;

    fn build_for(template_id: &str) -> EnvBuild {
        let mut b = EnvBuild::new_waiting(template_id, 1, 512);
        b.status = BuildStatus::Succeeded;
        b
    }

    #[test]
    fn parse_target_defaults_to_latest() {
        let t = parse_target("acme/app").unwrap();
        assert_eq!(t.identifier, "acme/app");
        assert_eq!(t.tag, DEFAULT_TAG);
    }

    #[test]
    fn parse_target_splits_on_last_colon() {
        let t = parse_target("acme/app:v2").unwrap();
        assert_eq!(t.identifier, "acme/app");
        assert_eq!(t.tag, "v2");
    }

    #[test]
    fn parse_target_rejects_invalid_tag_chars() {
        let err = parse_target("acme/app:bad/tag").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn assign_tags_commits_and_invalidates_cache() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;
        let build = store.seed_build(build_for("tpl1")).await;

        let cache = TemplateCache::new();
        let ctx = RequestContext::for_team("t1", team.id);

        let assigned = assign_tags(
            &*store,
            &cache,
            &ctx,
            &team,
            &[TagAssignment {
                target: "acme/app:v2".to_string(),
                build_id: build.id,
            }],
        )
        .await
        .unwrap();

        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].tag, "v2");
        let stored = store.get_tag("tpl1", "v2").await.unwrap().unwrap();
        assert_eq!(stored.build_id, build.id);
    }

    #[tokio::test]
    async fn assign_tags_rejects_build_from_a_different_template() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;
        let foreign_build = store.seed_build(build_for("tpl-other")).await;

        let cache = TemplateCache::new();
        let ctx = RequestContext::for_team("t1", team.id);

        let err = assign_tags(
            &*store,
            &cache,
            &ctx,
            &team,
            &[TagAssignment {
                target: "acme/app:v2".to_string(),
                build_id: foreign_build.id,
            }],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn delete_tags_rejects_latest() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;

        let cache = TemplateCache::new();
        let ctx = RequestContext::for_team("t1", team.id);

        let err = delete_tags(&*store, &cache, &ctx, &team, "acme/app", &["latest".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn delete_tags_removes_non_reserved_tag() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;
        let build = store.seed_build(build_for("tpl1")).await;
        store.assign_tags("tpl1", &[("v2".to_string(), build.id)]).await.unwrap();

        let cache = TemplateCache::new();
        let ctx = RequestContext::for_team("t1", team.id);

        delete_tags(&*store, &cache, &ctx, &team, "acme/app", &["v2".to_string()])
            .await
            .unwrap();
        assert!(store.get_tag("tpl1", "v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assign_tags_on_foreign_team_template_is_forbidden() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let other = store.seed_team("other").await;
        store.seed_template("tpl1", other.id, false).await;

        let cache = TemplateCache::new();
        let ctx = RequestContext::for_team("t1", team.id);

        let err = assign_tags(
            &*store,
            &cache,
            &ctx,
            &team,
            &[TagAssignment {
                target: "tpl1:v2".to_string(),
                build_id: Uuid::new_v4(),
            }],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
    }
}
