use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmployeeId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
}

/// HR record linked to at most one login. `manager_id` points at another employee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub user_id: Option<UserId>,
    pub manager_id: Option<EmployeeId>,
}

/// Identity performing an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: UserId(user_id.into()), is_admin: false }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self { user_id: UserId(user_id.into()), is_admin: true }
    }
}

pub trait Directory: Send + Sync {
    fn user(&self, id: &UserId) -> Option<User>;
    fn employee_for_user(&self, id: &UserId) -> Option<Employee>;
    fn employee(&self, id: &EmployeeId) -> Option<Employee>;

    fn display_name(&self, id: &UserId) -> String {
        self.user(id).map(|user| user.name).unwrap_or_else(|| id.0.clone())
    }

    fn email(&self, id: &UserId) -> Option<String> {
        self.user(id).and_then(|user| user.email).filter(|email| !email.trim().is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ManagerLookupError {
    #[error("no employee record found for user `{0}`")]
    NoEmployeeRecord(String),
    #[error("employee linked to user `{0}` has no manager assigned")]
    NoManager(String),
    #[error("manager of user `{0}` has no linked login")]
    ManagerWithoutLogin(String),
}

/// Walks requester -> employee -> manager employee -> manager login.
pub fn resolve_manager<D>(directory: &D, user: &UserId) -> Result<UserId, ManagerLookupError>
where
    D: Directory + ?Sized,
{
    let employee = directory
        .employee_for_user(user)
        .ok_or_else(|| ManagerLookupError::NoEmployeeRecord(user.0.clone()))?;
    let manager_id =
        employee.manager_id.ok_or_else(|| ManagerLookupError::NoManager(user.0.clone()))?;
    directory
        .employee(&manager_id)
        .and_then(|manager| manager.user_id)
        .ok_or_else(|| ManagerLookupError::ManagerWithoutLogin(user.0.clone()))
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    users: HashMap<UserId, User>,
    employees: HashMap<EmployeeId, Employee>,
    employee_by_user: HashMap<UserId, EmployeeId>,
}

impl InMemoryDirectory {
    pub fn with_user(mut self, id: &str, name: &str, email: Option<&str>) -> Self {
        self.insert_user(User {
            id: UserId(id.to_string()),
            name: name.to_string(),
            email: email.map(str::to_string),
        });
        self
    }

    pub fn with_employee(mut self, id: &str, user_id: Option<&str>, manager_id: Option<&str>) -> Self {
        self.insert_employee(Employee {
            id: EmployeeId(id.to_string()),
            user_id: user_id.map(|value| UserId(value.to_string())),
            manager_id: manager_id.map(|value| EmployeeId(value.to_string())),
        });
        self
    }

    pub fn insert_user(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_employee(&mut self, employee: Employee) {
        if let Some(user_id) = &employee.user_id {
            self.employee_by_user.insert(user_id.clone(), employee.id.clone());
        }
        self.employees.insert(employee.id.clone(), employee);
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }
}

impl Directory for InMemoryDirectory {
    fn user(&self, id: &UserId) -> Option<User> {
        self.users.get(id).cloned()
    }

    fn employee_for_user(&self, id: &UserId) -> Option<Employee> {
        self.employee_by_user.get(id).and_then(|employee_id| self.employees.get(employee_id)).cloned()
    }

    fn employee(&self, id: &EmployeeId) -> Option<Employee> {
        self.employees.get(id).cloned()
    }
}
