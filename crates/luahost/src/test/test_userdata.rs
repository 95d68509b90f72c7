// Tests for host objects exposed as userdata
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::*;

#[derive(LuaUserData, Default)]
#[lua(name = "HitCounter")]
struct Counter {
    pub name: String,
    #[lua(name = "count")]
    pub hits: i64,
    #[lua(readonly)]
    pub limit: i64,
    #[lua(skip)]
    pub secret: u32,
}

#[lua_methods]
impl Counter {
    pub fn new(name: &str, limit: i64) -> Self {
        Counter {
            name: name.to_owned(),
            limit,
            ..Default::default()
        }
    }

    pub fn hit(&mut self, n: i64) -> i64 {
        self.hits += n;
        self.hits
    }

    pub fn label(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.name)
    }

    pub fn check(&self) -> Result<i64, String> {
        if self.hits <= self.limit {
            Ok(self.limit - self.hits)
        } else {
            Err(format!("{} is over its limit", self.name))
        }
    }

    #[lua(name = "reset")]
    pub fn reset_hits(&mut self) {
        self.hits = 0;
    }
}

#[derive(LuaUserData, Clone, Debug, PartialEq, PartialOrd)]
#[lua_impl(Display, PartialEq, PartialOrd)]
struct Point {
    pub x: f64,
    pub y: f64,
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

struct Account {
    balance: i64,
}

impl LuaUserData for Account {
    fn describe(d: &mut UserDataDescriptor<Self>) {
        d.add_field_getter("balance", |a| a.balance);
        d.add_method_mut("deposit", |_, a, (amount, audit): (i64, Option<LuaFunctionRef>)| {
            a.balance += amount;
            if let Some(audit) = audit {
                audit.call::<_, ()>(())?;
            }
            Ok(a.balance)
        });
        d.add_function("open", |_, balance: i64| {
            Ok(Rc::new(RefCell::new(Account { balance })))
        });
        d.add_meta_method(MetaMethod::Len, |_, a, ()| Ok(a.balance));
    }
}

// ==================== Derive ====================

#[test]
fn test_derived_fields_and_methods() {
    let vm = LuaVM::new().unwrap();
    let shared = Rc::new(RefCell::new(Counter::new("clicks", 10)));
    vm.set_global("c", shared.clone()).unwrap();

    assert_eq!(vm.evaluate::<String>("return c.name").unwrap(), "clicks");
    assert_eq!(vm.evaluate::<i64>("return c:hit(3) + c:hit(2)").unwrap(), 8);
    assert_eq!(shared.borrow().hits, 5);
    assert_eq!(shared.borrow().secret, 0);
    assert_eq!(vm.evaluate::<i64>("return c.count").unwrap(), 5);
    assert_eq!(vm.evaluate::<String>("return c:label('#')").unwrap(), "#clicks");
    assert_eq!(vm.evaluate::<i64>("return c:check()").unwrap(), 5);

    vm.execute("c.name = 'taps'; c.count = 50").unwrap();
    assert_eq!(shared.borrow().name, "taps");
    let err = vm.execute("c:check()").unwrap_err();
    assert!(err.to_string().contains("taps is over its limit"), "{err}");

    vm.execute("c:reset()").unwrap();
    assert_eq!(shared.borrow().hits, 0);
}

#[test]
fn test_derived_field_rules() {
    let vm = LuaVM::new().unwrap();
    vm.set_global("c", Counter::new("x", 1)).unwrap();

    let err = vm.execute("c.limit = 5").unwrap_err();
    assert!(err.to_string().contains("field 'limit' of HitCounter is read-only"), "{err}");

    let err = vm.execute("c.nope = 1").unwrap_err();
    assert!(err.to_string().contains("HitCounter has no field 'nope'"), "{err}");

    // Skipped and renamed fields are invisible under their Rust names.
    assert!(vm.evaluate::<bool>("return c.secret == nil and c.hits == nil").unwrap());

    let err = vm.execute("c.count = 'many'").unwrap_err();
    assert!(err.to_string().contains("field 'count' of HitCounter"), "{err}");
}

#[test]
fn test_method_call_errors() {
    let vm = LuaVM::new().unwrap();
    vm.set_global("c", Counter::new("x", 1)).unwrap();

    let err = vm.execute("c.hit(1)").unwrap_err();
    assert!(err.to_string().contains("bad self for 'hit'"), "{err}");
    assert!(err.to_string().contains("call it with ':'"), "{err}");

    let err = vm.execute("c:hit('lots')").unwrap_err();
    assert!(err.to_string().contains("bad argument #2"), "{err}");
}

#[test]
fn test_identity_is_preserved() {
    let vm = LuaVM::new().unwrap();
    let shared = Rc::new(RefCell::new(Counter::new("same", 1)));
    vm.set_global("a", shared.clone()).unwrap();
    vm.set_global("b", shared.clone()).unwrap();
    assert!(vm.evaluate::<bool>("return rawequal(a, b)").unwrap());

    let back: Rc<RefCell<Counter>> = vm.get_global("a").unwrap();
    assert!(Rc::ptr_eq(&back, &shared));

    let other = Rc::new(RefCell::new(Counter::new("same", 1)));
    vm.set_global("b", other).unwrap();
    assert!(!vm.evaluate::<bool>("return rawequal(a, b)").unwrap());
}

#[test]
fn test_host_object_released_on_collect() {
    let vm = LuaVM::new().unwrap();
    let shared = Rc::new(RefCell::new(Counter::default()));
    vm.set_global("c", shared.clone()).unwrap();
    assert_eq!(Rc::strong_count(&shared), 2);

    vm.execute("c = nil").unwrap();
    vm.collect_garbage().unwrap();
    assert_eq!(Rc::strong_count(&shared), 1);
}

#[test]
fn test_trait_metamethods() {
    let vm = LuaVM::new().unwrap();
    let compare = vm
        .load("local a, b, c = ... return tostring(a), a == b, a == c, a < c, c <= a")
        .into_function()
        .unwrap();
    let p1 = Point { x: 1.0, y: 2.0 };
    let (text, same, different, less, less_eq): (String, bool, bool, bool, bool) = compare
        .call((p1.clone(), p1.clone(), Point { x: 3.0, y: 0.0 }))
        .unwrap();
    assert_eq!(text, "(1, 2)");
    assert!(same);
    assert!(!different);
    assert!(less);
    assert!(!less_eq);

    // Comparing with another userdata type is simply unequal.
    vm.set_global("p", p1).unwrap();
    vm.set_global("c", Counter::default()).unwrap();
    assert!(!vm.evaluate::<bool>("return p == c").unwrap());
}

// ==================== Manual impl ====================

#[test]
fn test_manual_impl() {
    let vm = LuaVM::new().unwrap();
    let account = vm.create_userdata(Account { balance: 10 }).unwrap();
    assert_eq!(account.type_name().unwrap(), "Account");
    assert!(account.is::<Account>());
    assert!(!account.is::<Counter>());
    vm.set_global("acct", &account).unwrap();

    assert_eq!(vm.evaluate::<i64>("return acct:deposit(5)").unwrap(), 15);
    assert_eq!(vm.evaluate::<i64>("return #acct").unwrap(), 15);
    assert_eq!(vm.evaluate::<i64>("return acct.open(3).balance").unwrap(), 3);
    assert_eq!(vm.evaluate::<String>("return getmetatable(acct)").unwrap(), "Account");

    account.with_mut(|a: &mut Account| a.balance = 100).unwrap();
    assert_eq!(vm.evaluate::<i64>("return acct.balance").unwrap(), 100);
    assert_eq!(account.with(|a: &Account| a.balance).unwrap(), 100);
    assert!(account.with(|_: &Counter| ()).is_err());
    assert_eq!(account.shared::<Account>().unwrap().borrow().balance, 100);
}

#[test]
fn test_reentrant_borrow_conflict() {
    let vm = LuaVM::new().unwrap();
    vm.set_global("acct", vm.create_userdata(Account { balance: 0 }).unwrap())
        .unwrap();
    let err = vm
        .execute("acct:deposit(1, function() return acct.balance end)")
        .unwrap_err();
    assert!(matches!(err, LuaError::BorrowConflict(_)), "{err}");

    // The borrow is released after the failure.
    assert_eq!(vm.evaluate::<i64>("return acct.balance").unwrap(), 1);
}

#[test]
fn test_registered_metatable() {
    let vm = LuaVM::new().unwrap();
    let metatable = vm.register_userdata_type::<Account>().unwrap();
    assert_eq!(metatable.raw_get::<_, String>("__name").unwrap(), "Account");
    assert!(metatable.raw_get::<_, LuaValue>("__len").unwrap().as_function().is_some());

    // Registering again returns the same table.
    assert_eq!(vm.register_userdata_type::<Account>().unwrap(), metatable);
}

// ==================== Builder ====================

#[test]
fn test_builder_for_foreign_type() {
    let vm = LuaVM::new().unwrap();
    let ud = UserDataBuilder::new(Duration::from_millis(1500))
        .set_type_name("Duration")
        .add_field_getter("secs", |d| d.as_secs_f64())
        .add_method("millis", |_, d, ()| Ok(d.as_millis() as i64))
        .add_method_mut("add_millis", |_, d, ms: u64| {
            *d += Duration::from_millis(ms);
            Ok(())
        })
        .set_tostring(|d| format!("{}s", d.as_secs_f64()))
        .build(&vm)
        .unwrap();
    assert_eq!(ud.type_name().unwrap(), "Duration");
    vm.set_global("d", &ud).unwrap();

    assert_eq!(vm.evaluate::<f64>("return d.secs").unwrap(), 1.5);
    assert_eq!(vm.evaluate::<i64>("return d:millis()").unwrap(), 1500);
    assert_eq!(vm.evaluate::<String>("return tostring(d)").unwrap(), "1.5s");

    vm.execute("d:add_millis(500)").unwrap();
    assert_eq!(ud.with(|d: &Duration| d.as_millis()).unwrap(), 2000);
}

#[test]
fn test_builder_objects_are_fully_collected() {
    let vm = LuaVM::new().unwrap();
    let marker = Rc::new(());
    let build = |vm: &LuaVM| {
        UserDataBuilder::new(marker.clone())
            .set_type_name("Marker")
            .add_field_getter("holders", |m| Rc::strong_count(m) as i64)
            .add_method("ping", |_, _, ()| Ok("pong"))
            .build(vm)
            .unwrap()
    };
    let first = build(&vm);
    vm.set_global("m", &first).unwrap();
    assert_eq!(vm.evaluate::<String>("return m:ping()").unwrap(), "pong");
    drop(first);
    vm.execute("m = nil").unwrap();
    vm.collect_garbage().unwrap();
    vm.collect_garbage().unwrap();
    let baseline = vm.used_memory();

    for _ in 0..2000 {
        drop(build(&vm));
    }
    vm.collect_garbage().unwrap();
    vm.collect_garbage().unwrap();

    assert_eq!(Rc::strong_count(&marker), 1);
    assert!(
        vm.used_memory() < baseline + 64 * 1024,
        "builder metatables were kept: {} bytes before, {} after",
        baseline,
        vm.used_memory()
    );
}
