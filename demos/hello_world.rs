use pool_allocator::PooledMalloc;

// This is the magic line that creates a PooledMalloc and uses it globally.
#[global_allocator]
static A: PooledMalloc = PooledMalloc::new();

fn main() {
    println!("Hello, World!");
}
