//! Interactive transactions.
//!
//! Requests sent through a [`Stream`] carry its id in the header, so the
//! server runs them in order inside one transaction started with
//! [`Stream::begin`].

use std::time::Duration;

use serde::Serialize;

use crate::codec::{Isolation, Operation, Response, SelectOptions};
use crate::connection::{Connection, RequestOptions};
use crate::error::Result;
use crate::schema::SpaceRef;

/// A request stream bound to one connection.
#[derive(Debug, Clone)]
pub struct Stream {
    conn: Connection,
    id: u64,
}

impl Stream {
    pub(crate) fn new(conn: Connection, id: u64) -> Self {
        Self { conn, id }
    }

    /// Stream id sent with every request.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Start a transaction with the server's default timeout and isolation.
    pub async fn begin(&self) -> Result<()> {
        self.begin_with(None, Isolation::Default).await
    }

    pub async fn begin_with(&self, timeout: Option<Duration>, isolation: Isolation) -> Result<()> {
        self.execute(Operation::Begin { timeout, isolation })
            .await
            .map(drop)
    }

    pub async fn commit(&self) -> Result<()> {
        self.execute(Operation::Commit).await.map(drop)
    }

    pub async fn rollback(&self) -> Result<()> {
        self.execute(Operation::Rollback).await.map(drop)
    }

    pub async fn execute(&self, op: Operation) -> Result<Response> {
        self.execute_with(op, RequestOptions::default()).await
    }

    pub async fn execute_with(&self, op: Operation, options: RequestOptions) -> Result<Response> {
        self.conn.execute_in_stream(&op, options, self.id).await
    }

    pub async fn select<K: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        key: K,
        options: SelectOptions,
    ) -> Result<Response> {
        self.execute(Operation::select(space, key, options)?).await
    }

    pub async fn insert<T: Serialize>(&self, space: impl Into<SpaceRef>, tuple: T) -> Result<Response> {
        self.execute(Operation::insert(space, tuple)?).await
    }

    pub async fn replace<T: Serialize>(&self, space: impl Into<SpaceRef>, tuple: T) -> Result<Response> {
        self.execute(Operation::replace(space, tuple)?).await
    }

    pub async fn update<K: Serialize, O: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        key: K,
        ops: O,
    ) -> Result<Response> {
        self.execute(Operation::update(space, key, ops)?).await
    }

    pub async fn upsert<T: Serialize, O: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        tuple: T,
        ops: O,
    ) -> Result<Response> {
        self.execute(Operation::upsert(space, tuple, ops)?).await
    }

    pub async fn delete<K: Serialize>(&self, space: impl Into<SpaceRef>, key: K) -> Result<Response> {
        self.execute(Operation::delete(space, key)?).await
    }

    pub async fn call<A: Serialize>(&self, function: impl Into<String>, args: A) -> Result<Response> {
        self.execute(Operation::call(function, args)?).await
    }

    pub async fn eval<A: Serialize>(&self, expression: impl Into<String>, args: A) -> Result<Response> {
        self.execute(Operation::eval(expression, args)?).await
    }
}
