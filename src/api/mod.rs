//! Typed client for the task service REST API.
//!
//! Thin wrapper over [`Fetch`]: one method per endpoint, JSON in and out.
//! Passing the gateway's fetcher here routes every call through the response
//! cache; passing [`crate::net::NetFetcher`] talks to the network directly.

pub mod types;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::net::{Fetch, FetchRequest, FetchResponse, HttpMethod};
use crate::queue::{
  CategoryMutation, Mutation, MutationExecutor, NoteMutation, QueuedMutation, TaskMutation,
};
use types::{
  Category, CategoryPatch, NewCategory, NewNote, NewTask, Note, NotePatch, PushServerKey,
  PushSubscriptionRecord, Task, TaskPatch,
};

/// Task service API client.
#[derive(Clone)]
pub struct ApiClient {
  fetch: Arc<dyn Fetch>,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(fetch: Arc<dyn Fetch>, base_url: Url) -> Self {
    Self {
      fetch,
      base_url,
      token: None,
    }
  }

  /// Attach a bearer token to every request.
  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn request(&self, method: HttpMethod, path: &str) -> SyncResult<FetchRequest> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| SyncError::InvalidRequest(format!("bad endpoint '{}': {}", path, e)))?;

    let mut req = FetchRequest::new(method, url).with_header("accept", "application/json");
    if let Some(token) = &self.token {
      req = req.with_header("authorization", &format!("Bearer {}", token));
    }
    Ok(req)
  }

  async fn send(&self, req: FetchRequest) -> SyncResult<FetchResponse> {
    let resp = self.fetch.fetch(req).await?;
    if let Some(err) = resp.error() {
      return Err(err);
    }
    Ok(resp)
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
    self.send(self.request(HttpMethod::Get, path)?).await?.json()
  }

  /// List all tasks.
  pub async fn list_tasks(&self) -> SyncResult<Vec<Task>> {
    self.get_json("api/tasks").await
  }

  /// Get a single task by id.
  pub async fn get_task(&self, id: &str) -> SyncResult<Task> {
    self.get_json(&format!("api/tasks/{}", id)).await
  }

  /// Create a task from a client-assigned draft.
  pub async fn create_task(&self, draft: &NewTask) -> SyncResult<Task> {
    let req = self
      .request(HttpMethod::Post, "api/tasks")?
      .with_json_body(draft)?;
    self.send(req).await?.json()
  }

  /// Apply a partial update to a task.
  pub async fn update_task(&self, id: &str, patch: &TaskPatch) -> SyncResult<Task> {
    let req = self
      .request(HttpMethod::Put, &format!("api/tasks/{}", id))?
      .with_json_body(patch)?;
    self.send(req).await?.json()
  }

  /// Delete a task.
  pub async fn delete_task(&self, id: &str) -> SyncResult<()> {
    self
      .send(self.request(HttpMethod::Delete, &format!("api/tasks/{}", id))?)
      .await?;
    Ok(())
  }

  /// List all categories.
  pub async fn list_categories(&self) -> SyncResult<Vec<Category>> {
    self.get_json("api/categories").await
  }

  /// Create a category from a client-assigned draft.
  pub async fn create_category(&self, draft: &NewCategory) -> SyncResult<Category> {
    let req = self
      .request(HttpMethod::Post, "api/categories")?
      .with_json_body(draft)?;
    self.send(req).await?.json()
  }

  /// Apply a partial update to a category.
  pub async fn update_category(&self, id: &str, patch: &CategoryPatch) -> SyncResult<Category> {
    let req = self
      .request(HttpMethod::Put, &format!("api/categories/{}", id))?
      .with_json_body(patch)?;
    self.send(req).await?.json()
  }

  /// Delete a category.
  pub async fn delete_category(&self, id: &str) -> SyncResult<()> {
    self
      .send(self.request(HttpMethod::Delete, &format!("api/categories/{}", id))?)
      .await?;
    Ok(())
  }

  /// List the notes attached to a task.
  pub async fn list_notes(&self, task_id: &str) -> SyncResult<Vec<Note>> {
    self.get_json(&format!("api/tasks/{}/notes", task_id)).await
  }

  /// Create a note from a client-assigned draft.
  pub async fn create_note(&self, draft: &NewNote) -> SyncResult<Note> {
    let req = self
      .request(HttpMethod::Post, "api/notes")?
      .with_json_body(draft)?;
    self.send(req).await?.json()
  }

  /// Apply a partial update to a note.
  pub async fn update_note(&self, id: &str, patch: &NotePatch) -> SyncResult<Note> {
    let req = self
      .request(HttpMethod::Put, &format!("api/notes/{}", id))?
      .with_json_body(patch)?;
    self.send(req).await?.json()
  }

  /// Delete a note.
  pub async fn delete_note(&self, id: &str) -> SyncResult<()> {
    self
      .send(self.request(HttpMethod::Delete, &format!("api/notes/{}", id))?)
      .await?;
    Ok(())
  }

  /// Fetch the server's public key for creating push subscriptions.
  pub async fn push_server_key(&self) -> SyncResult<String> {
    let key: PushServerKey = self.get_json("api/push/key").await?;
    Ok(key.key)
  }

  /// Register this device's push subscription with the backend.
  pub async fn register_push_subscription(
    &self,
    record: &PushSubscriptionRecord,
  ) -> SyncResult<()> {
    let req = self
      .request(HttpMethod::Post, "api/push/subscriptions")?
      .with_json_body(record)?;
    self.send(req).await?;
    Ok(())
  }

  /// Remove this device's push subscription from the backend.
  pub async fn remove_push_subscription(&self, endpoint: &str) -> SyncResult<()> {
    let req = self
      .request(HttpMethod::Delete, "api/push/subscriptions")?
      .with_json_body(&serde_json::json!({ "endpoint": endpoint }))?;
    self.send(req).await?;
    Ok(())
  }
}

/// Delivers queued mutations through the REST API.
///
/// A delivery is acknowledged by response status alone; bodies are never
/// parsed here, so endpoints answering 201/204 with no payload count as
/// delivered. Typed responses stay the business of [`ApiClient`].
pub struct ApiExecutor {
  client: ApiClient,
}

impl ApiExecutor {
  pub fn new(client: ApiClient) -> Self {
    Self { client }
  }

  fn request_for(&self, queued: &QueuedMutation) -> SyncResult<FetchRequest> {
    let client = &self.client;
    match &queued.mutation {
      Mutation::Task(TaskMutation::Create(draft)) => client
        .request(HttpMethod::Post, "api/tasks")?
        .with_json_body(draft),
      Mutation::Task(TaskMutation::Update { id, patch }) => client
        .request(HttpMethod::Put, &format!("api/tasks/{}", id))?
        .with_json_body(patch),
      Mutation::Task(TaskMutation::Delete { id }) => {
        client.request(HttpMethod::Delete, &format!("api/tasks/{}", id))
      }
      Mutation::Category(CategoryMutation::Create(draft)) => client
        .request(HttpMethod::Post, "api/categories")?
        .with_json_body(draft),
      Mutation::Category(CategoryMutation::Update { id, patch }) => client
        .request(HttpMethod::Put, &format!("api/categories/{}", id))?
        .with_json_body(patch),
      Mutation::Category(CategoryMutation::Delete { id }) => {
        client.request(HttpMethod::Delete, &format!("api/categories/{}", id))
      }
      Mutation::Note(NoteMutation::Create(draft)) => client
        .request(HttpMethod::Post, "api/notes")?
        .with_json_body(draft),
      Mutation::Note(NoteMutation::Update { id, patch }) => client
        .request(HttpMethod::Put, &format!("api/notes/{}", id))?
        .with_json_body(patch),
      Mutation::Note(NoteMutation::Delete { id }) => {
        client.request(HttpMethod::Delete, &format!("api/notes/{}", id))
      }
    }
  }
}

impl MutationExecutor for ApiExecutor {
  fn execute<'a>(&'a self, queued: &'a QueuedMutation) -> BoxFuture<'a, SyncResult<()>> {
    Box::pin(async move {
      let req = self.request_for(queued)?;
      self.client.send(req).await?;
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockFetch;
  use chrono::Utc;

  fn client(mock: Arc<MockFetch>) -> ApiClient {
    let base = Url::parse("https://tasks.test/").unwrap();
    ApiClient::new(mock, base).with_token("secret")
  }

  #[tokio::test]
  async fn test_list_tasks_parses_payload() {
    let mock = Arc::new(MockFetch::new());
    mock.respond_json(
      HttpMethod::Get,
      "/api/tasks",
      r#"[{"id":"t-1","title":"buy milk","completed":false,"updated_at":"2024-05-01T10:00:00Z"}]"#,
    );

    let tasks = client(Arc::clone(&mock)).list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "t-1");
    assert_eq!(tasks[0].title, "buy milk");
    assert!(!tasks[0].completed);
  }

  #[tokio::test]
  async fn test_create_task_parses_created_entity() {
    let mock = Arc::new(MockFetch::new());
    mock.respond_json(
      HttpMethod::Post,
      "/api/tasks",
      r#"{"id":"t-9","title":"water plants","completed":false,"updated_at":"2024-05-01T10:00:00Z"}"#,
    );

    let draft = NewTask {
      id: "t-9".to_string(),
      title: "water plants".to_string(),
      description: None,
      due_at: None,
      category_id: None,
    };
    let task = client(Arc::clone(&mock)).create_task(&draft).await.unwrap();
    assert_eq!(task.id, "t-9");
    assert_eq!(task.title, "water plants");
  }

  #[tokio::test]
  async fn test_error_statuses_are_classified() {
    let mock = Arc::new(MockFetch::new());
    mock.respond_status(HttpMethod::Get, "/api/tasks", 503);
    mock.respond_status(HttpMethod::Get, "/api/categories", 401);

    let client = client(mock);
    assert_eq!(
      client.list_tasks().await.unwrap_err(),
      SyncError::ServerError { status: 503 }
    );
    assert_eq!(
      client.list_categories().await.unwrap_err(),
      SyncError::Unauthorized
    );
  }

  #[test]
  fn test_requests_carry_bearer_token() {
    let mock = Arc::new(MockFetch::new());
    let req = client(mock).request(HttpMethod::Get, "api/tasks").unwrap();

    assert!(req
      .headers
      .iter()
      .any(|(name, value)| name == "authorization" && value == "Bearer secret"));
    assert_eq!(req.url.as_str(), "https://tasks.test/api/tasks");
  }

  #[tokio::test]
  async fn test_executor_maps_mutations_to_endpoints() {
    let mock = Arc::new(MockFetch::new());
    let executor = ApiExecutor::new(client(Arc::clone(&mock)));

    let mutations = vec![
      Mutation::Task(TaskMutation::Create(NewTask {
        id: "t-9".to_string(),
        title: "water plants".to_string(),
        description: None,
        due_at: None,
        category_id: None,
      })),
      Mutation::Task(TaskMutation::Update {
        id: "t-9".to_string(),
        patch: TaskPatch {
          completed: Some(true),
          ..Default::default()
        },
      }),
      Mutation::Note(NoteMutation::Delete {
        id: "n-3".to_string(),
      }),
    ];

    for (i, mutation) in mutations.into_iter().enumerate() {
      let queued = QueuedMutation {
        id: format!("m-{}", i),
        mutation,
        enqueued_at: Utc::now(),
        retry_count: 0,
      };
      executor.execute(&queued).await.unwrap();
    }

    assert_eq!(
      mock.calls(),
      vec![
        (HttpMethod::Post, "/api/tasks".to_string()),
        (HttpMethod::Put, "/api/tasks/t-9".to_string()),
        (HttpMethod::Delete, "/api/notes/n-3".to_string()),
      ]
    );
  }

  #[tokio::test]
  async fn test_executor_acks_on_status_alone() {
    let mock = Arc::new(MockFetch::new());
    // Empty-bodied acks, as REST creates and deletes commonly answer.
    mock.respond_status(HttpMethod::Post, "/api/tasks", 201);
    mock.respond_status(HttpMethod::Delete, "/api/tasks/t-9", 204);
    let executor = ApiExecutor::new(client(Arc::clone(&mock)));

    let mutations = vec![
      Mutation::Task(TaskMutation::Create(NewTask {
        id: "t-9".to_string(),
        title: "water plants".to_string(),
        description: None,
        due_at: None,
        category_id: None,
      })),
      Mutation::Task(TaskMutation::Delete {
        id: "t-9".to_string(),
      }),
    ];

    for (i, mutation) in mutations.into_iter().enumerate() {
      let queued = QueuedMutation {
        id: format!("m-{}", i),
        mutation,
        enqueued_at: Utc::now(),
        retry_count: 0,
      };
      executor.execute(&queued).await.unwrap();
    }
    assert_eq!(mock.call_count("/api/tasks"), 1);
    assert_eq!(mock.call_count("/api/tasks/t-9"), 1);
  }
}
