use avl_multimap::{AvlMultiMap, Error};

fn main() {
    let mut map = AvlMultiMap::new();
    map.insert(0, "zero");
    map.insert(1, "one");
    map.insert(2, "two");
    map.insert(2, "deux");
    map.insert(3, "three");
    map.insert(4, "four");
    map.insert(5, "five");
    assert_eq!(map.get(&1), Some(&"one"));
    assert_eq!(map.pop(&1), Ok("one"));
    assert_eq!(map.pop(&1), Err(Error::KeyNotFound));
    assert_eq!(map.count(&2), 2);
    assert_eq!(map.pop_item(&2, &"deux"), Ok((2, "deux")));

    for (k, v) in &map {
        println!("{k} => {v}");
    }

    println!("Descending:");
    for (k, v) in map.iter().rev() {
        println!("{k} => {v}");
    }

    match map.min() {
        Ok((k, v)) => println!("min: {k} => {v}"),
        Err(err) => println!("{err}"),
    }
}
