//! Relational store port.
//!
//! The relational store is an external collaborator, specified only by
//! interface. The two flows that must be transactional (tag assignment,
//! build registration) are modeled as single atomic `Store` operations
//! rather than a generic `begin`/`commit` pair -- the store backend owns
//! the transaction, the control plane only needs the guarantee that either
//! the whole composite write lands or none of it does. [`InMemoryStore`] is
//! the reference implementation used by tests and the demo binary.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::{Alias, Checkpoint, EnvBuild, Snapshot, Tag, Team, Template, Volume};

#[async_trait]
pub trait Store: Send + Sync {
    // -- teams / users -----------------------------------------------
    async fn get_team(&self, team_id: Uuid) -> ApiResult<Team>;
    async fn list_user_teams(&self, user_id: Uuid) -> ApiResult<Vec<Team>>;
    async fn default_team_for_user(&self, user_id: Uuid) -> ApiResult<Option<Team>>;

    // -- templates / aliases ------------------------------------------
    async fn get_template(&self, template_id: &str) -> ApiResult<Option<Template>>;
    /// Exact-match namespaced lookup: `team_slug` is `None` for bare ids.
    async fn resolve_alias(&self, identifier: &str, team_slug: Option<&str>) -> ApiResult<Option<Alias>>;
    async fn set_template_public(&self, template_id: &str, public: bool) -> ApiResult<()>;

    // -- builds ---------------------------------------------------------
    async fn get_build(&self, build_id: Uuid) -> ApiResult<Option<EnvBuild>>;
    async fn update_build(&self, build: EnvBuild) -> ApiResult<()>;
    async fn list_builds_for_template(&self, template_id: &str) -> ApiResult<Vec<EnvBuild>>;

    /// Registers a new build: atomically upsert the template row, fail any
    /// previous in-progress build of the same template, insert the new
    /// `waiting` build, and claim/update the alias. Fails with `Conflict`
    /// if the alias already points at a *different* template owned by a
    /// different team.
    async fn register_build(
        &self,
        template: Template,
        alias_identifier: &str,
        new_build: EnvBuild,
    ) -> ApiResult<(Template, EnvBuild, Vec<String>)>;

    // -- tags -------------------------------------------------------------
    async fn get_tag(&self, template_id: &str, tag: &str) -> ApiResult<Option<Tag>>;
    async fn list_tags_for_template(&self, template_id: &str) -> ApiResult<Vec<Tag>>;
    /// Assign flow: upsert every `(template_id, tag) -> build_id` pair
    /// atomically.
    async fn assign_tags(&self, template_id: &str, tags: &[(String, Uuid)]) -> ApiResult<()>;
    /// Delete flow: bulk-delete, atomically.
    async fn delete_tags(&self, template_id: &str, tags: &[String]) -> ApiResult<()>;

    // -- snapshots --------------------------------------------------------
    /// Recovers the owning team for a sandbox id the orchestrator no longer
    /// knows about (already reaped), by whichever snapshot was taken of it
    /// last. Used by the proxy resume coordinator to resolve a team before it
    /// can call `get_last_snapshot` (which itself requires a team id), since
    /// the proxy's resume request carries nothing but a sandbox id.
    async fn find_team_for_sandbox(&self, sandbox_id: &str) -> ApiResult<Option<Uuid>>;
    async fn get_last_snapshot(&self, sandbox_id: &str, team_id: Uuid) -> ApiResult<Option<Snapshot>>;
    async fn insert_snapshot(&self, snapshot: Snapshot) -> ApiResult<()>;
    /// Cursor is an opaque offset, a documented simplification over a true
    /// opaque token.
    async fn list_snapshots(
        &self,
        sandbox_id: Option<&str>,
        team_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> ApiResult<(Vec<Snapshot>, usize)>;

    // -- checkpoints --------------------------------------------------------
    async fn list_checkpoints(&self, sandbox_id: &str, team_id: Uuid) -> ApiResult<Vec<Checkpoint>>;
    async fn get_checkpoint(&self, checkpoint_id: Uuid, sandbox_id: &str, team_id: Uuid) -> ApiResult<Option<Checkpoint>>;
    async fn insert_checkpoint(&self, checkpoint: Checkpoint) -> ApiResult<()>;

    // -- volumes --------------------------------------------------------
    async fn get_volume_by_name(&self, team_id: Uuid, name: &str) -> ApiResult<Option<Volume>>;
}

/// In-memory reference implementation, used by tests and the demo binary.
/// Guarded by a single `RwLock` per table: simple, and sufficient since the
/// demo never runs under real contention (unlike the production store,
/// which is out of scope here).
#[derive(Default)]
pub struct InMemoryStore {
    teams: RwLock<HashMap<Uuid, Team>>,
    user_teams: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    default_team: RwLock<HashMap<Uuid, Uuid>>,
    templates: RwLock<HashMap<String, Template>>,
    aliases: RwLock<HashMap<String, Alias>>,
    builds: RwLock<HashMap<Uuid, EnvBuild>>,
    tags: RwLock<HashMap<(String, String), Tag>>,
    snapshots: RwLock<Vec<Snapshot>>,
    checkpoints: RwLock<Vec<Checkpoint>>,
    volumes: RwLock<HashMap<(Uuid, String), Volume>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed_team(&self, slug: &str) -> Team {
        let team = Team {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.to_string(),
            cluster_id: Some(Uuid::new_v4()),
            limits: crate::model::TeamLimits::default(),
            tier: None,
        };
        self.teams.write().await.insert(team.id, team.clone());
        team
    }

    pub async fn seed_team_with_limits(&self, slug: &str, limits: crate::model::TeamLimits) -> Team {
        let mut team = self.seed_team(slug).await;
        team.limits = limits;
        self.teams.write().await.insert(team.id, team.clone());
        team
    }

    pub async fn seed_user_in_team(&self, team_id: Uuid, is_default: bool) -> Uuid {
        let user_id = Uuid::new_v4();
        self.user_teams.write().await.entry(user_id).or_default().push(team_id);
        if is_default {
            self.default_team.write().await.insert(user_id, team_id);
        }
        user_id
    }

    pub async fn seed_template(&self, id: &str, team_id: Uuid, public: bool) -> Template {
        let template = Template {
            id: id.to_string(),
            team_id,
            public,
            cluster_id: None,
            created_by: None,
        };
        self.templates.write().await.insert(template.id.clone(), template.clone());
        template
    }

    pub async fn seed_alias(&self, identifier: &str, team_id: Uuid, template_id: &str, public: bool) -> Alias {
        let alias = Alias {
            identifier: identifier.to_string(),
            team_id,
            template_id: template_id.to_string(),
            public,
        };
        self.aliases.write().await.insert(alias.identifier.clone(), alias.clone());
        alias
    }

    pub async fn seed_build(&self, build: EnvBuild) -> EnvBuild {
        self.builds.write().await.insert(build.id, build.clone());
        build
    }

    pub async fn seed_volume(&self, team_id: Uuid, name: &str) -> Volume {
        let volume = Volume {
            id: Uuid::new_v4(),
            team_id,
            name: name.to_string(),
            kind: "local".to_string(),
        };
        self.volumes
            .write()
            .await
            .insert((team_id, volume.name.clone()), volume.clone());
        volume
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_team(&self, team_id: Uuid) -> ApiResult<Team> {
        self.teams
            .read()
            .await
            .get(&team_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("team not found"))
    }

    async fn list_user_teams(&self, user_id: Uuid) -> ApiResult<Vec<Team>> {
        let ids = self.user_teams.read().await.get(&user_id).cloned().unwrap_or_default();
        let teams = self.teams.read().await;
        Ok(ids.into_iter().filter_map(|id| teams.get(&id).cloned()).collect())
    }

    async fn default_team_for_user(&self, user_id: Uuid) -> ApiResult<Option<Team>> {
        let Some(team_id) = self.default_team.read().await.get(&user_id).copied() else {
            return Ok(None);
        };
        Ok(self.teams.read().await.get(&team_id).cloned())
    }

    async fn get_template(&self, template_id: &str) -> ApiResult<Option<Template>> {
        Ok(self.templates.read().await.get(template_id).cloned())
    }

    async fn resolve_alias(&self, identifier: &str, team_slug: Option<&str>) -> ApiResult<Option<Alias>> {
        let key = match team_slug {
            Some(slug) => format!("{}/{}", slug, identifier),
            None => identifier.to_string(),
        };
        Ok(self.aliases.read().await.get(&key).cloned())
    }

    async fn set_template_public(&self, template_id: &str, public: bool) -> ApiResult<()> {
        let mut templates = self.templates.write().await;
        let t = templates
            .get_mut(template_id)
            .ok_or_else(|| ApiError::not_found("template not found"))?;
        t.public = public;
        Ok(())
    }

    async fn get_build(&self, build_id: Uuid) -> ApiResult<Option<EnvBuild>> {
        Ok(self.builds.read().await.get(&build_id).cloned())
    }

    async fn update_build(&self, build: EnvBuild) -> ApiResult<()> {
        self.builds.write().await.insert(build.id, build);
        Ok(())
    }

    async fn list_builds_for_template(&self, template_id: &str) -> ApiResult<Vec<EnvBuild>> {
        Ok(self
            .builds
            .read()
            .await
            .values()
            .filter(|b| b.template_id == template_id)
            .cloned()
            .collect())
    }

    async fn register_build(
        &self,
        template: Template,
        alias_identifier: &str,
        new_build: EnvBuild,
    ) -> ApiResult<(Template, EnvBuild, Vec<String>)> {
        let mut templates = self.templates.write().await;
        let mut aliases = self.aliases.write().await;
        let mut builds = self.builds.write().await;

        let key = alias_identifier.to_string();
        if let Some(existing) = aliases.get(&key)
            && existing.team_id != template.team_id
        {
            return Err(ApiError::invalid_input("alias taken by another team"));
        }

        for build in builds.values_mut() {
            if build.template_id == template.id && build.status.is_in_progress() {
                build.status = crate::model::BuildStatus::Failed;
            }
        }

        templates.insert(template.id.clone(), template.clone());
        aliases.insert(
            key.clone(),
            Alias {
                identifier: key.clone(),
                team_id: template.team_id,
                template_id: template.id.clone(),
                public: template.public,
            },
        );
        builds.insert(new_build.id, new_build.clone());

        Ok((template, new_build, vec![key]))
    }

    async fn get_tag(&self, template_id: &str, tag: &str) -> ApiResult<Option<Tag>> {
        Ok(self
            .tags
            .read()
            .await
            .get(&(template_id.to_string(), tag.to_string()))
            .cloned())
    }

    async fn list_tags_for_template(&self, template_id: &str) -> ApiResult<Vec<Tag>> {
        Ok(self
            .tags
            .read()
            .await
            .values()
            .filter(|t| t.template_id == template_id)
            .cloned()
            .collect())
    }

    async fn assign_tags(&self, template_id: &str, tags: &[(String, Uuid)]) -> ApiResult<()> {
        let mut table = self.tags.write().await;
        for (tag, build_id) in tags {
            table.insert(
                (template_id.to_string(), tag.clone()),
                Tag {
                    template_id: template_id.to_string(),
                    tag: tag.clone(),
                    build_id: *build_id,
                },
            );
        }
        Ok(())
    }

    async fn delete_tags(&self, template_id: &str, tags: &[String]) -> ApiResult<()> {
        let mut table = self.tags.write().await;
        for tag in tags {
            table.remove(&(template_id.to_string(), tag.clone()));
        }
        Ok(())
    }

    async fn find_team_for_sandbox(&self, sandbox_id: &str) -> ApiResult<Option<Uuid>> {
        let snaps = self.snapshots.read().await;
        Ok(snaps
            .iter()
            .filter(|s| s.source_sandbox_id == sandbox_id)
            .max_by_key(|s| s.created_at)
            .map(|s| s.team_id))
    }

    async fn get_last_snapshot(&self, sandbox_id: &str, team_id: Uuid) -> ApiResult<Option<Snapshot>> {
        let snaps = self.snapshots.read().await;
        Ok(snaps
            .iter()
            .filter(|s| s.source_sandbox_id == sandbox_id && s.team_id == team_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn insert_snapshot(&self, snapshot: Snapshot) -> ApiResult<()> {
        self.snapshots.write().await.push(snapshot);
        Ok(())
    }

    async fn list_snapshots(
        &self,
        sandbox_id: Option<&str>,
        team_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> ApiResult<(Vec<Snapshot>, usize)> {
        let snaps = self.snapshots.read().await;
        let mut filtered: Vec<Snapshot> = snaps
            .iter()
            .filter(|s| s.team_id == team_id && sandbox_id.is_none_or(|id| s.source_sandbox_id == id))
            .cloned()
            .collect();
        filtered.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        let total = filtered.len();
        let page = filtered.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn list_checkpoints(&self, sandbox_id: &str, team_id: Uuid) -> ApiResult<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .iter()
            .filter(|c| c.sandbox_id == sandbox_id && c.team_id == team_id)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, checkpoint_id: Uuid, sandbox_id: &str, team_id: Uuid) -> ApiResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .iter()
            .find(|c| c.id == checkpoint_id && c.sandbox_id == sandbox_id && c.team_id == team_id)
            .cloned())
    }

    async fn insert_checkpoint(&self, checkpoint: Checkpoint) -> ApiResult<()> {
        self.checkpoints.write().await.push(checkpoint);
        Ok(())
    }

    async fn get_volume_by_name(&self, team_id: Uuid, name: &str) -> ApiResult<Option<Volume>> {
        Ok(self.volumes.read().await.get(&(team_id, name.to_string())).cloned())
    }
}
