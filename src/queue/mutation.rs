//! Write operations as a tagged union keyed by entity type and operation
//! kind, each variant carrying a strongly-typed payload.

use serde::{Deserialize, Serialize};

use crate::api::types::{CategoryPatch, NewCategory, NewNote, NewTask, NotePatch, TaskPatch};

/// Operation kind; maps one-to-one onto an HTTP verb during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::Create => "create",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    }
  }
}

/// A pending write operation destined for the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "op", rename_all = "lowercase")]
pub enum Mutation {
  Task(TaskMutation),
  Category(CategoryMutation),
  Note(NoteMutation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum TaskMutation {
  Create(NewTask),
  Update { id: String, patch: TaskPatch },
  Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum CategoryMutation {
  Create(NewCategory),
  Update { id: String, patch: CategoryPatch },
  Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum NoteMutation {
  Create(NewNote),
  Update { id: String, patch: NotePatch },
  Delete { id: String },
}

impl Mutation {
  /// Entity family name, used in ids, logs, and endpoint paths.
  pub fn entity_type(&self) -> &'static str {
    match self {
      Mutation::Task(_) => "task",
      Mutation::Category(_) => "category",
      Mutation::Note(_) => "note",
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      Mutation::Task(m) => m.kind(),
      Mutation::Category(m) => m.kind(),
      Mutation::Note(m) => m.kind(),
    }
  }

  /// Id of the entity this mutation targets. Creates carry the
  /// client-assigned id of the entity being created.
  pub fn entity_id(&self) -> &str {
    match self {
      Mutation::Task(TaskMutation::Create(new)) => &new.id,
      Mutation::Task(TaskMutation::Update { id, .. }) => id,
      Mutation::Task(TaskMutation::Delete { id }) => id,
      Mutation::Category(CategoryMutation::Create(new)) => &new.id,
      Mutation::Category(CategoryMutation::Update { id, .. }) => id,
      Mutation::Category(CategoryMutation::Delete { id }) => id,
      Mutation::Note(NoteMutation::Create(new)) => &new.id,
      Mutation::Note(NoteMutation::Update { id, .. }) => id,
      Mutation::Note(NoteMutation::Delete { id }) => id,
    }
  }
}

impl TaskMutation {
  fn kind(&self) -> MutationKind {
    match self {
      TaskMutation::Create(_) => MutationKind::Create,
      TaskMutation::Update { .. } => MutationKind::Update,
      TaskMutation::Delete { .. } => MutationKind::Delete,
    }
  }
}

impl CategoryMutation {
  fn kind(&self) -> MutationKind {
    match self {
      CategoryMutation::Create(_) => MutationKind::Create,
      CategoryMutation::Update { .. } => MutationKind::Update,
      CategoryMutation::Delete { .. } => MutationKind::Delete,
    }
  }
}

impl NoteMutation {
  fn kind(&self) -> MutationKind {
    match self {
      NoteMutation::Create(_) => MutationKind::Create,
      NoteMutation::Update { .. } => MutationKind::Update,
      NoteMutation::Delete { .. } => MutationKind::Delete,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mutation_roundtrips_through_json() {
    let mutation = Mutation::Task(TaskMutation::Update {
      id: "t-42".to_string(),
      patch: TaskPatch {
        completed: Some(true),
        ..Default::default()
      },
    });

    let json = serde_json::to_string(&mutation).unwrap();
    let back: Mutation = serde_json::from_str(&json).unwrap();
    assert_eq!(mutation, back);
    assert_eq!(back.entity_type(), "task");
    assert_eq!(back.kind(), MutationKind::Update);
    assert_eq!(back.entity_id(), "t-42");
  }

  #[test]
  fn test_create_carries_client_id() {
    let mutation = Mutation::Note(NoteMutation::Create(NewNote {
      id: "n-1".to_string(),
      task_id: "t-1".to_string(),
      body: "call the landlord".to_string(),
    }));

    assert_eq!(mutation.kind(), MutationKind::Create);
    assert_eq!(mutation.entity_id(), "n-1");
  }
}
