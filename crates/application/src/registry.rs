//! 连接注册表
//!
//! 本实例上“用户 → 连接”与“房间 → 连接”的索引。所有变更都在同一把锁内完成，
//! 锁只覆盖内存中的 map 操作与快照复制，绝不跨越 I/O 或 `.await`。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::{ConnectionId, RoomId, UserId};
use tracing::debug;

use crate::connection::Connection;

/// 注册表统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
}

struct Member {
    connection: Arc<Connection>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Member>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    /// 按加入顺序保存
    rooms: HashMap<RoomId, Vec<Arc<Connection>>>,
}

impl RegistryState {
    fn detach_from_room(&mut self, room_id: RoomId, connection_id: ConnectionId) {
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.retain(|member| member.id() != connection_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
    }
}

/// 本实例的连接注册表
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // 锁内没有会 panic 的用户代码，中毒后的数据仍然一致
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册连接。同一个连接重复注册返回 `false`。
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        let connection_id = connection.id();
        let user_id = connection.user_id();
        let mut state = self.lock();
        if state.connections.contains_key(&connection_id) {
            return false;
        }
        state.connections.insert(
            connection_id,
            Member {
                connection,
                rooms: HashSet::new(),
            },
        );
        state.users.entry(user_id).or_default().insert(connection_id);
        drop(state);

        debug!(connection_id = %connection_id, user_id = %user_id, "connection registered");
        true
    }

    /// 注销连接并从所有房间移除；幂等，重复注销返回 `false`。
    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(member) = state.connections.remove(&connection_id) else {
            return false;
        };

        let user_id = member.connection.user_id();
        if let Some(ids) = state.users.get_mut(&user_id) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                state.users.remove(&user_id);
            }
        }
        for room_id in &member.rooms {
            state.detach_from_room(*room_id, connection_id);
        }
        drop(state);

        debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            rooms = member.rooms.len(),
            "connection unregistered"
        );
        true
    }

    /// 加入房间。未注册（或已注销）的连接无法加入，返回 `false`；重复加入是无操作。
    pub fn join(&self, room_id: RoomId, connection_id: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(member) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        if !member.rooms.insert(room_id) {
            return true;
        }
        let connection = Arc::clone(&member.connection);
        state.rooms.entry(room_id).or_default().push(connection);
        true
    }

    /// 离开房间。未加入或房间不存在时是无操作，返回 `false`。
    pub fn leave(&self, room_id: RoomId, connection_id: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(member) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        if !member.rooms.remove(&room_id) {
            return false;
        }
        state.detach_from_room(room_id, connection_id);
        true
    }

    /// 房间成员的时间点快照（按加入顺序）。空房间返回空列表。
    pub fn snapshot_room(&self, room_id: RoomId) -> Vec<Arc<Connection>> {
        self.lock().rooms.get(&room_id).cloned().unwrap_or_default()
    }

    /// 某个用户在本实例上的所有连接（多设备）
    pub fn user_connections(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        let state = self.lock();
        state
            .users
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(|member| Arc::clone(&member.connection))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 连接当前加入的房间（升序）
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        let state = self.lock();
        let mut rooms: Vec<RoomId> = state
            .connections
            .get(&connection_id)
            .map(|member| member.rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&connection_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            connections: state.connections.len(),
            users: state.users.len(),
            rooms: state.rooms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::outbox;
    use tokio_util::sync::CancellationToken;

    fn connection(user: i64) -> Arc<Connection> {
        let (outbox, _rx) = outbox(4, CancellationToken::new());
        Arc::new(Connection::new(UserId::new(user), outbox))
    }

    fn ids(connections: &[Arc<Connection>]) -> Vec<ConnectionId> {
        connections.iter().map(|c| c.id()).collect()
    }

    #[test]
    fn snapshot_keeps_join_order_and_ignores_duplicates() {
        let registry = ConnectionRegistry::new();
        let room = RoomId::new(7);
        let a = connection(1);
        let b = connection(2);
        registry.register(a.clone());
        registry.register(b.clone());

        assert!(registry.join(room, b.id()));
        assert!(registry.join(room, a.id()));
        assert!(registry.join(room, b.id()));

        assert_eq!(ids(&registry.snapshot_room(room)), vec![b.id(), a.id()]);
    }

    #[test]
    fn unregister_is_idempotent_and_clears_every_index() {
        let registry = ConnectionRegistry::new();
        let a = connection(1);
        registry.register(a.clone());
        registry.join(RoomId::new(1), a.id());
        registry.join(RoomId::new(2), a.id());

        assert!(registry.unregister(a.id()));
        assert!(!registry.unregister(a.id()));

        assert!(registry.snapshot_room(RoomId::new(1)).is_empty());
        assert!(registry.snapshot_room(RoomId::new(2)).is_empty());
        assert!(registry.user_connections(UserId::new(1)).is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn unknown_connection_cannot_join() {
        let registry = ConnectionRegistry::new();
        let a = connection(1);
        assert!(!registry.join(RoomId::new(1), a.id()));
        assert!(registry.snapshot_room(RoomId::new(1)).is_empty());
    }

    #[test]
    fn leave_on_unknown_room_is_noop_and_empty_rooms_disappear() {
        let registry = ConnectionRegistry::new();
        let a = connection(1);
        registry.register(a.clone());

        assert!(!registry.leave(RoomId::new(9), a.id()));
        registry.join(RoomId::new(9), a.id());
        assert_eq!(registry.stats().rooms, 1);
        assert!(registry.leave(RoomId::new(9), a.id()));
        assert_eq!(registry.stats().rooms, 0);
        assert!(registry.rooms_of(a.id()).is_empty());
    }

    #[test]
    fn user_may_hold_several_connections() {
        let registry = ConnectionRegistry::new();
        let phone = connection(5);
        let laptop = connection(5);
        registry.register(phone.clone());
        registry.register(laptop.clone());

        let mut held = ids(&registry.user_connections(UserId::new(5)));
        held.sort();
        let mut expected = vec![phone.id(), laptop.id()];
        expected.sort();
        assert_eq!(held, expected);
        assert_eq!(registry.stats().users, 1);

        registry.unregister(phone.id());
        assert_eq!(ids(&registry.user_connections(UserId::new(5))), vec![laptop.id()]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = ConnectionRegistry::new();
        let a = connection(1);
        registry.register(a.clone());
        registry.join(RoomId::new(1), a.id());

        let snapshot = registry.snapshot_room(RoomId::new(1));
        registry.unregister(a.id());

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot_room(RoomId::new(1)).is_empty());
    }
}
