pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use id_counter::IdCounter;
pub use wrapped::WrappedRcRefCell;

mod id_counter;
mod wrapped;
