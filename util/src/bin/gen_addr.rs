use graviton::addr::NodeAddr;

/// Prints a fresh random node address for provisioning a new node.
pub fn main() {
    println!("{}", NodeAddr::random());
}
