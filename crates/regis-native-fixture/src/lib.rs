//! Module natif `fixture` : exporté via l'ABI C de regis.

use regis_runtime::{regis_module, regis_native, Error, Value};

regis_native!(add |frame, _ctx| {
    let (a, b) = (frame.arg(0)?.as_int()?, frame.arg(1)?.as_int()?);
    frame.ret(Value::Integer(a.wrapping_add(b)))
});

regis_native!(greet |frame, _ctx| {
    let name = frame.arg(0)?;
    frame.ret(Value::String(format!("Hello, {name}!")))
});

// Somme des entiers d'un vecteur.
regis_native!(total |frame, _ctx| {
    let Value::Vector(items) = frame.arg(0)? else {
        return Err(Error::type_mismatch("Vector", &frame.arg(0)?));
    };
    let sum = items.iter().map(Value::as_int).sum::<Result<i64, _>>()?;
    frame.ret(Value::Integer(sum))
});

regis_native!(refuse |frame, _ctx| {
    Err(Error::Throw(Value::String(format!("refused: {}", frame.arg(0)?))))
});

regis_native!(broken |_frame, _ctx| {
    Err(Error::DivisionByZero)
});

regis_module! {
    "add"    => (Some(2), add),
    "greet"  => (Some(1), greet),
    "total"  => (Some(1), total),
    "refuse" => (Some(1), refuse),
    "broken" => (None, broken),
}
