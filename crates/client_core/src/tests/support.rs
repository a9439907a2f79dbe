//! Scripted in-memory gateway shared by the unit tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{Priority, Todo, TodoId, TodoStatus},
    error::ApiException,
    protocol::{CreateTodoRequest, OperationAck, UpdateTodoRequest},
};
use tokio::sync::Mutex;

use crate::gateway::{GatewayError, TodoGateway};

pub(crate) type Scripted<T> = Result<T, GatewayError>;

pub(crate) fn todo(id: &str, title: &str, status: TodoStatus) -> Todo {
    let at = Utc.with_ymd_and_hms(2024, 3, 19, 0, 0, 0).unwrap();
    Todo {
        id: TodoId::from(id),
        title: title.to_string(),
        description: None,
        status,
        priority: Priority::Medium,
        due_date: None,
        created_at: at,
        updated_at: at,
    }
}

pub(crate) fn ack(id: &str) -> OperationAck {
    OperationAck {
        message: "queued".into(),
        todo_id: TodoId::from(id),
    }
}

pub(crate) fn api_error(status: u16, message: &str) -> GatewayError {
    GatewayError::Api(ApiException::new(status, message))
}

pub(crate) fn not_found() -> GatewayError {
    api_error(404, "Todo not found")
}

/// Answers each call from a per-kind queue. An exhausted read queue answers 404;
/// an exhausted mutation queue answers 500.
#[derive(Default)]
pub(crate) struct ScriptedGateway {
    lists: Mutex<VecDeque<Scripted<Vec<Todo>>>>,
    reads: Mutex<HashMap<TodoId, VecDeque<Scripted<Todo>>>>,
    creates: Mutex<VecDeque<Scripted<OperationAck>>>,
    updates: Mutex<VecDeque<Scripted<OperationAck>>>,
    deletes: Mutex<VecDeque<Scripted<OperationAck>>>,
    pub(crate) calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push_list(&self, result: Scripted<Vec<Todo>>) {
        self.lists.lock().await.push_back(result);
    }

    pub(crate) async fn push_read(&self, id: &str, result: Scripted<Todo>) {
        self.reads
            .lock()
            .await
            .entry(TodoId::from(id))
            .or_default()
            .push_back(result);
    }

    pub(crate) async fn repeat_read(&self, id: &str, result: Scripted<Todo>, times: usize) {
        for _ in 0..times {
            self.push_read(id, result.clone()).await;
        }
    }

    pub(crate) async fn push_create(&self, result: Scripted<OperationAck>) {
        self.creates.lock().await.push_back(result);
    }

    pub(crate) async fn push_update(&self, result: Scripted<OperationAck>) {
        self.updates.lock().await.push_back(result);
    }

    pub(crate) async fn push_delete(&self, result: Scripted<OperationAck>) {
        self.deletes.lock().await.push_back(result);
    }

    pub(crate) async fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

fn unscripted<T>() -> Scripted<T> {
    Err(api_error(500, "unscripted call"))
}

#[async_trait]
impl TodoGateway for ScriptedGateway {
    async fn list(&self) -> Result<Vec<Todo>, GatewayError> {
        self.record("list".into()).await;
        self.lists
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn get(&self, id: &TodoId) -> Result<Todo, GatewayError> {
        self.record(format!("get {id}")).await;
        self.reads
            .lock()
            .await
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(not_found()))
    }

    async fn create(&self, input: &CreateTodoRequest) -> Result<OperationAck, GatewayError> {
        self.record(format!("create {}", input.title)).await;
        self.creates.lock().await.pop_front().unwrap_or_else(unscripted)
    }

    async fn update(
        &self,
        id: &TodoId,
        _patch: &UpdateTodoRequest,
    ) -> Result<OperationAck, GatewayError> {
        self.record(format!("update {id}")).await;
        self.updates.lock().await.pop_front().unwrap_or_else(unscripted)
    }

    async fn delete(&self, id: &TodoId) -> Result<OperationAck, GatewayError> {
        self.record(format!("delete {id}")).await;
        self.deletes.lock().await.pop_front().unwrap_or_else(unscripted)
    }
}
