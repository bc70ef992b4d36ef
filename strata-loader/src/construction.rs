//! Entity construction and authorization.
//!
//! Raw rows become typed entities through a two-step pipeline: construct
//! the entity from its row, then evaluate the privacy policy for the
//! requested action. Both steps are fallible per row; batch construction
//! preserves order and reports one `EntityResult` per input row, so a
//! single bad row never poisons its batch.
//!
//! Panics inside construction or a rule are not caught. An error return
//! means "this row failed"; a panic means the process state is suspect
//! and unwinds like any other bug.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use strata_core::{
    AuthorizationAction, EntityConfiguration, EntityError, EntityResult, EntityRow, FieldValue,
    RuleEvaluation, ViewerContext,
};

use crate::context::QueryContext;

/// A typed entity constructed from a stored row.
pub trait Entity: Sized + Send + Sync {
    /// Construct from a row. The row is guaranteed nothing beyond what
    /// the configuration declares; implementations validate their own
    /// fields and report `EntityError::Construction` on malformed data.
    fn from_row(config: &EntityConfiguration, row: &EntityRow) -> EntityResult<Self>;

    /// The entity's id value.
    fn id(&self) -> FieldValue;
}

/// One rule in a privacy policy chain.
///
/// Rules see the fully constructed entity, the viewer, and the query
/// context (so a rule may issue its own authorized loads). A rule error
/// fails that entity's authorization; it is not treated as a deny of
/// record but surfaces as-is.
#[async_trait]
pub trait PrivacyRule<E: Entity>: Send + Sync {
    async fn evaluate(
        &self,
        viewer: &ViewerContext,
        query_context: &QueryContext,
        entity: &E,
    ) -> EntityResult<RuleEvaluation>;
}

/// Rule that allows every viewer.
pub struct AlwaysAllow;

#[async_trait]
impl<E: Entity> PrivacyRule<E> for AlwaysAllow {
    async fn evaluate(
        &self,
        _viewer: &ViewerContext,
        _query_context: &QueryContext,
        _entity: &E,
    ) -> EntityResult<RuleEvaluation> {
        Ok(RuleEvaluation::Allow)
    }
}

/// Rule that denies every viewer.
pub struct AlwaysDeny;

#[async_trait]
impl<E: Entity> PrivacyRule<E> for AlwaysDeny {
    async fn evaluate(
        &self,
        _viewer: &ViewerContext,
        _query_context: &QueryContext,
        _entity: &E,
    ) -> EntityResult<RuleEvaluation> {
        Ok(RuleEvaluation::Deny)
    }
}

/// Rule that allows the trusted internal viewer and defers otherwise.
pub struct AllowIfInternal;

#[async_trait]
impl<E: Entity> PrivacyRule<E> for AllowIfInternal {
    async fn evaluate(
        &self,
        viewer: &ViewerContext,
        _query_context: &QueryContext,
        _entity: &E,
    ) -> EntityResult<RuleEvaluation> {
        if viewer.is_internal() {
            Ok(RuleEvaluation::Allow)
        } else {
            Ok(RuleEvaluation::Skip)
        }
    }
}

/// Ordered privacy rule chains, one per action.
///
/// Evaluation walks the chain for the action in declared order; the
/// first `Allow` or `Deny` is decisive. An exhausted chain (all `Skip`,
/// or no rules declared for the action) fails closed.
pub struct PrivacyPolicy<E: Entity> {
    read: Vec<Arc<dyn PrivacyRule<E>>>,
    create: Vec<Arc<dyn PrivacyRule<E>>>,
    update: Vec<Arc<dyn PrivacyRule<E>>>,
    delete: Vec<Arc<dyn PrivacyRule<E>>>,
}

impl<E: Entity> Default for PrivacyPolicy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> PrivacyPolicy<E> {
    /// An empty policy. Until rules are added, every action fails closed.
    pub fn new() -> Self {
        Self {
            read: Vec::new(),
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }

    pub fn read_rule(mut self, rule: Arc<dyn PrivacyRule<E>>) -> Self {
        self.read.push(rule);
        self
    }

    pub fn create_rule(mut self, rule: Arc<dyn PrivacyRule<E>>) -> Self {
        self.create.push(rule);
        self
    }

    pub fn update_rule(mut self, rule: Arc<dyn PrivacyRule<E>>) -> Self {
        self.update.push(rule);
        self
    }

    pub fn delete_rule(mut self, rule: Arc<dyn PrivacyRule<E>>) -> Self {
        self.delete.push(rule);
        self
    }

    /// Add `rule` to every action's chain.
    pub fn rule_for_all_actions(self, rule: Arc<dyn PrivacyRule<E>>) -> Self {
        self.read_rule(Arc::clone(&rule))
            .create_rule(Arc::clone(&rule))
            .update_rule(Arc::clone(&rule))
            .delete_rule(rule)
    }

    fn rules_for(&self, action: AuthorizationAction) -> &[Arc<dyn PrivacyRule<E>>] {
        match action {
            AuthorizationAction::Read => &self.read,
            AuthorizationAction::Create => &self.create,
            AuthorizationAction::Update => &self.update,
            AuthorizationAction::Delete => &self.delete,
        }
    }
}

/// Constructs entities from rows and enforces the privacy policy.
pub struct ConstructionPipeline<E: Entity> {
    config: Arc<EntityConfiguration>,
    policy: Arc<PrivacyPolicy<E>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> ConstructionPipeline<E> {
    pub fn new(config: Arc<EntityConfiguration>, policy: Arc<PrivacyPolicy<E>>) -> Self {
        Self {
            config,
            policy,
            _entity: PhantomData,
        }
    }

    /// The entity configuration this pipeline serves.
    pub fn config(&self) -> &Arc<EntityConfiguration> {
        &self.config
    }

    /// Evaluate the policy chain for `action` against one entity.
    ///
    /// Fails closed: no decisive rule means `Unauthorized`.
    pub async fn authorize(
        &self,
        viewer: &ViewerContext,
        query_context: &QueryContext,
        action: AuthorizationAction,
        entity: &E,
    ) -> EntityResult<()> {
        for rule in self.policy.rules_for(action) {
            match rule.evaluate(viewer, query_context, entity).await? {
                RuleEvaluation::Allow => return Ok(()),
                RuleEvaluation::Deny => {
                    return Err(EntityError::Unauthorized {
                        table: self.config.table_name().to_string(),
                        action,
                        reason: "denied by privacy rule".to_string(),
                    })
                }
                RuleEvaluation::Skip => continue,
            }
        }
        debug!(
            table = self.config.table_name(),
            ?action,
            "privacy chain exhausted without a decisive rule"
        );
        Err(EntityError::Unauthorized {
            table: self.config.table_name().to_string(),
            action,
            reason: "no privacy rule allowed the action".to_string(),
        })
    }

    fn construct_one(&self, row: &EntityRow) -> EntityResult<E> {
        if row.get_non_null(self.config.id_field()).is_none() {
            return Err(EntityError::Construction {
                table: self.config.table_name().to_string(),
                reason: format!("row has no '{}' value", self.config.id_field()),
            });
        }
        E::from_row(&self.config, row)
    }

    /// Construct and authorize a batch, one result per input row, in
    /// input order. A row that fails construction or authorization
    /// yields its own `Err` without affecting its neighbors.
    pub async fn construct_and_authorize(
        &self,
        viewer: &ViewerContext,
        query_context: &QueryContext,
        action: AuthorizationAction,
        rows: &[EntityRow],
    ) -> Vec<EntityResult<E>> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let result = match self.construct_one(row) {
                Ok(entity) => match self
                    .authorize(viewer, query_context, action, &entity)
                    .await
                {
                    Ok(()) => Ok(entity),
                    Err(error) => Err(error),
                },
                Err(error) => Err(error),
            };
            results.push(result);
        }
        results
    }

    /// Like `construct_and_authorize`, but the first failure fails the
    /// whole batch.
    pub async fn construct_and_authorize_enforcing(
        &self,
        viewer: &ViewerContext,
        query_context: &QueryContext,
        action: AuthorizationAction,
        rows: &[EntityRow],
    ) -> EntityResult<Vec<E>> {
        self.construct_and_authorize(viewer, query_context, action, rows)
            .await
            .into_iter()
            .collect()
    }
}
